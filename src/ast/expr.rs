//! Expression builders.
//!
//! Free functions cover prefix forms (`fn_`, `case`, `exists`, aggregates);
//! [`ExprExt`] adds the infix forms to anything convertible into a [`Node`]:
//!
//! ```ignore
//! let pred = users.c("age").ge(18).and(users.c("active").eq(true));
//! ```

use std::sync::Arc;

use super::types::{
    Case, Cast, Expression, Function, Node, NodeList, Op, QueryNode, QuerySource, Source, Sql,
};
use super::value::Value;

pub fn binary(lhs: impl Into<Node>, op: Op, rhs: impl Into<Node>) -> Node {
    Node::Expression(Box::new(Expression {
        lhs: lhs.into(),
        op,
        rhs: rhs.into(),
        flat: false,
    }))
}

/// Same as [`binary`] but rendered without surrounding parentheses.
pub fn flat(lhs: impl Into<Node>, op: Op, rhs: impl Into<Node>) -> Node {
    Node::Expression(Box::new(Expression {
        lhs: lhs.into(),
        op,
        rhs: rhs.into(),
        flat: true,
    }))
}

/// AND-combine predicates. Returns `None` for an empty input.
pub fn and_<I, N>(nodes: I) -> Option<Node>
where
    I: IntoIterator<Item = N>,
    N: Into<Node>,
{
    nodes
        .into_iter()
        .map(Into::into)
        .reduce(|acc, n| binary(acc, Op::And, n))
}

pub fn or_<I, N>(nodes: I) -> Option<Node>
where
    I: IntoIterator<Item = N>,
    N: Into<Node>,
{
    nodes
        .into_iter()
        .map(Into::into)
        .reduce(|acc, n| binary(acc, Op::Or, n))
}

pub fn not_(node: impl Into<Node>) -> Node {
    Node::Negated(Box::new(node.into()))
}

pub fn fn_<I, N>(name: &str, args: I) -> Function
where
    I: IntoIterator<Item = N>,
    N: Into<Node>,
{
    Function::new(name, args.into_iter().map(Into::into).collect())
}

/// Raw SQL fragment; each `?` in `text` consumes one of `params`.
pub fn sql(text: &str, params: Vec<Value>) -> Node {
    Node::Sql(Sql {
        text: text.to_string(),
        params,
    })
}

/// Sub-query in expression position.
pub fn subquery(query: Arc<dyn QueryNode>) -> Node {
    Node::Source(Source::Query(QuerySource { query, alias: None }))
}

pub fn exists(query: Arc<dyn QueryNode>) -> Node {
    Node::from(Function::new("EXISTS", vec![subquery(query)]))
}

pub fn case(predicate: Option<Node>, whens: Vec<(Node, Node)>, default: Option<Node>) -> Node {
    Node::Case(Box::new(Case {
        predicate,
        whens,
        default,
    }))
}

pub fn cast(node: impl Into<Node>, data_type: &str) -> Node {
    Node::Cast(Box::new(Cast {
        node: node.into(),
        data_type: data_type.to_string(),
    }))
}

pub fn count(node: impl Into<Node>) -> Function {
    Function::new("COUNT", vec![node.into()])
}

/// `COUNT(*)`.
pub fn count_star() -> Function {
    Function::new("COUNT", vec![Node::Star(None)])
}

pub fn sum(node: impl Into<Node>) -> Function {
    Function::new("SUM", vec![node.into()])
}

pub fn avg(node: impl Into<Node>) -> Function {
    Function::new("AVG", vec![node.into()])
}

pub fn max(node: impl Into<Node>) -> Function {
    Function::new("MAX", vec![node.into()])
}

pub fn min(node: impl Into<Node>) -> Function {
    Function::new("MIN", vec![node.into()])
}

/// Comma separated list, optionally wrapped in parentheses.
pub fn list<I, N>(nodes: I, parens: bool) -> Node
where
    I: IntoIterator<Item = N>,
    N: Into<Node>,
{
    let list = NodeList::comma(nodes.into_iter().map(Into::into).collect());
    Node::List(if parens { list.parens() } else { list })
}

/// Infix operators for anything that converts into a [`Node`].
pub trait ExprExt: Into<Node> + Sized {
    fn eq(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Eq, rhs)
    }

    fn ne(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Ne, rhs)
    }

    fn lt(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Lt, rhs)
    }

    fn le(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Le, rhs)
    }

    fn gt(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Gt, rhs)
    }

    fn ge(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Ge, rhs)
    }

    fn in_(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::In, rhs)
    }

    fn not_in(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::NotIn, rhs)
    }

    fn is_null(self) -> Node {
        binary(self, Op::Is, Value::Null)
    }

    fn is_not_null(self) -> Node {
        binary(self, Op::IsNot, Value::Null)
    }

    fn like(self, pattern: impl Into<Node>) -> Node {
        binary(self, Op::Like, pattern)
    }

    fn ilike(self, pattern: impl Into<Node>) -> Node {
        binary(self, Op::ILike, pattern)
    }

    fn regexp(self, pattern: impl Into<Node>) -> Node {
        binary(self, Op::Regexp, pattern)
    }

    fn between(self, low: impl Into<Node>, high: impl Into<Node>) -> Node {
        binary(self, Op::Between, flat(low, Op::And, high))
    }

    fn concat(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Concat, rhs)
    }

    fn add(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Add, rhs)
    }

    fn sub(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Sub, rhs)
    }

    fn mul(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Mul, rhs)
    }

    fn div(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Div, rhs)
    }

    fn and(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::And, rhs)
    }

    fn or(self, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Or, rhs)
    }

    fn op(self, op: &str, rhs: impl Into<Node>) -> Node {
        binary(self, Op::Custom(op.to_string()), rhs)
    }

    fn cast(self, data_type: &str) -> Node {
        cast(self, data_type)
    }
}

impl<T: Into<Node>> ExprExt for T {}
