//! Blocking PostgreSQL backend over `tokio-postgres`.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

use super::connection::{Connection, Cursor, DriverResult, VecCursor};
use crate::ast::value::Value;
use crate::error::DriverError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub ssl_mode: SslMode,
    /// Skip certificate verification in `Prefer`/`Require` modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// PEM bundle used instead of the system trust store.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

/// Standard libpq `sslmode` values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl ConnectionConfig {
    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quarry")
            .join("connections.toml")
    }

    /// Saved connections; an absent file means none.
    pub fn load_saved() -> anyhow::Result<Vec<ConnectionConfig>> {
        Self::load_saved_from(&Self::config_path())
    }

    pub fn load_saved_from(path: &Path) -> anyhow::Result<Vec<ConnectionConfig>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_saved(&content)
    }

    pub fn save_all(connections: &[ConnectionConfig]) -> anyhow::Result<()> {
        Self::save_all_to(&Self::config_path(), connections)
    }

    pub fn save_all_to(path: &Path, connections: &[ConnectionConfig]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, render_saved(connections)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn find_saved(name: &str) -> anyhow::Result<Option<ConnectionConfig>> {
        Self::find_saved_in(&Self::config_path(), name)
    }

    pub fn find_saved_in(path: &Path, name: &str) -> anyhow::Result<Option<ConnectionConfig>> {
        Ok(Self::load_saved_from(path)?.into_iter().find(|c| c.name == name))
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: String::from("Local PostgreSQL"),
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedConnections {
    connections: Vec<ConnectionConfig>,
}

fn parse_saved(content: &str) -> anyhow::Result<Vec<ConnectionConfig>> {
    let saved: SavedConnections = toml::from_str(content).context("Invalid connections file")?;
    Ok(saved.connections)
}

fn render_saved(connections: &[ConnectionConfig]) -> anyhow::Result<String> {
    let saved = SavedConnections {
        connections: connections.to_vec(),
    };
    Ok(toml::to_string_pretty(&saved)?)
}

/// Connect and spawn the connection task on the current runtime.
pub async fn create_client(config: &ConnectionConfig) -> anyhow::Result<Client> {
    let conn_string = config.connection_string();
    let timeout = Duration::from_secs(15);

    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!(error = %e, "connection error");
                }
            });
            client
        }
        mode => {
            let strict = matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)?;
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL over TLS")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!(error = %e, "connection error");
                }
            });
            client
        }
    };

    Ok(client)
}

fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> anyhow::Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        for block in pem_blocks(&pem)? {
            let cert = native_tls::Certificate::from_pem(block.as_bytes())
                .context("Failed to parse certificate")?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into one string per certificate.
fn pem_blocks(pem: &[u8]) -> anyhow::Result<Vec<String>> {
    let text = std::str::from_utf8(pem).context("CA certificate file is not valid UTF-8")?;
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            current = Some(String::new());
        }
        if let Some(block) = current.as_mut() {
            block.push_str(line.trim());
            block.push('\n');
        }
        if line.contains("-----END CERTIFICATE-----") {
            blocks.extend(current.take());
        }
    }
    if blocks.is_empty() {
        anyhow::bail!("No valid certificates found in PEM data");
    }
    Ok(blocks)
}

/// Quote a value for a libpq key=value connection string.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// DB-API error name for a SQLSTATE code, by class.
fn sqlstate_error_name(code: &str) -> &'static str {
    match code.get(..2).unwrap_or("") {
        "23" => "IntegrityError",
        "22" => "DataError",
        "0A" => "NotSupportedError",
        "XX" => "InternalError",
        "42" | "26" | "2B" | "34" | "3D" | "3F" | "44" => "ProgrammingError",
        "08" | "25" | "40" | "53" | "54" | "55" | "57" | "58" => "OperationalError",
        _ => "DatabaseError",
    }
}

fn driver_error(err: &tokio_postgres::Error) -> DriverError {
    match err.as_db_error() {
        Some(db_err) => DriverError::new(
            sqlstate_error_name(db_err.code().code()),
            db_err.message().to_string(),
        ),
        None if err.is_closed() => DriverError::new("OperationalError", err.to_string()),
        None => DriverError::new("InterfaceError", err.to_string()),
    }
}

type BoxError = Box<dyn StdError + Sync + Send>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

fn is_text_type(ty: &Type) -> bool {
    <String as ToSql>::accepts(ty)
}

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    format!("cannot bind {:?} to a parameter of type {}", value, ty).into()
}

/// Write a decimal literal (`-12.50`, `NaN`, `Infinity`) in NUMERIC's binary
/// form: base-10000 digit groups after a weight, sign and display scale.
fn encode_numeric(text: &str, out: &mut BytesMut) -> Result<(), BoxError> {
    let special = match text {
        "NaN" => Some(NUMERIC_NAN),
        "inf" | "Infinity" => Some(NUMERIC_PINF),
        "-inf" | "-Infinity" => Some(NUMERIC_NINF),
        _ => None,
    };
    if let Some(sign) = special {
        out.put_i16(0);
        out.put_i16(0);
        out.put_u16(sign);
        out.put_u16(0);
        return Ok(());
    }

    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (NUMERIC_NEG, rest),
        None => (NUMERIC_POS, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part) {
        return Err(format!("invalid numeric literal {:?}", text).into());
    }
    let dscale = u16::try_from(frac_part.len())?;

    let int_part = int_part.trim_start_matches('0');
    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let padded: Vec<u8> = std::iter::repeat(b'0')
        .take(int_pad)
        .chain(int_part.bytes())
        .chain(frac_part.bytes())
        .chain(std::iter::repeat(b'0').take(frac_pad))
        .collect();
    let mut groups: Vec<i16> = padded
        .chunks(4)
        .map(|chunk| chunk.iter().fold(0i16, |acc, b| acc * 10 + i16::from(b - b'0')))
        .collect();
    let mut weight = i16::try_from((int_part.len() + int_pad) / 4)? - 1;

    let leading = groups.iter().take_while(|g| **g == 0).count();
    let mut groups = groups.split_off(leading);
    weight -= i16::try_from(leading)?;
    while groups.last() == Some(&0) {
        groups.pop();
    }
    let (weight, sign) = if groups.is_empty() { (0, NUMERIC_POS) } else { (weight, sign) };

    out.put_i16(i16::try_from(groups.len())?);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(dscale);
    for group in groups {
        out.put_i16(group);
    }
    Ok(())
}

/// Render a binary NUMERIC as its decimal text.
fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let word = |i: usize| -> Result<[u8; 2], BoxError> {
        raw.get(i * 2..i * 2 + 2)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| "truncated numeric value".into())
    };
    let ndigits = usize::try_from(i16::from_be_bytes(word(0)?))?;
    let weight = i32::from(i16::from_be_bytes(word(1)?));
    let sign = u16::from_be_bytes(word(2)?);
    let dscale = usize::from(u16::from_be_bytes(word(3)?));
    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    let digits = (0..ndigits)
        .map(|i| word(4 + i).map(i16::from_be_bytes))
        .collect::<Result<Vec<i16>, _>>()?;
    let digit = |i: i32| -> i16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for i in 1..=weight {
            text.push_str(&format!("{:04}", digit(i)));
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        frac.truncate(dscale);
        text.push('.');
        text.push_str(&frac);
    }
    Ok(text)
}

/// Integral NUMERICs that fit become `Int`, the rest `Float`.
fn numeric_value(text: &str) -> Value {
    if !text.contains('.') {
        if let Ok(i) = text.parse::<i64>() {
            return Value::Int(i);
        }
    }
    text.parse::<f64>()
        .map(Value::Float)
        .unwrap_or_else(|_| Value::Text(text.to_string()))
}

struct Numeric(String);

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_numeric(raw).map(Numeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn float_literal(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f == f64::INFINITY {
        "Infinity".to_string()
    } else if f == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        f.to_string()
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if self.is_null() {
            return Ok(IsNull::Yes);
        }
        if is_text_type(ty) && !matches!(self, Value::Bytes(_)) {
            return self.display().as_str().to_sql(ty, out);
        }
        match (self, ty) {
            (Value::Bool(b), &Type::BOOL) => b.to_sql(ty, out),
            (Value::Int(i), &Type::INT2) => i16::try_from(*i)?.to_sql(ty, out),
            (Value::Int(i), &Type::INT4) => i32::try_from(*i)?.to_sql(ty, out),
            (Value::Int(i), &Type::INT8) => i.to_sql(ty, out),
            (Value::Int(i), &Type::OID) => u32::try_from(*i)?.to_sql(ty, out),
            (Value::Int(i), &Type::FLOAT4) => (*i as f32).to_sql(ty, out),
            (Value::Int(i), &Type::FLOAT8) => (*i as f64).to_sql(ty, out),
            (Value::Int(i), &Type::NUMERIC) => {
                encode_numeric(&i.to_string(), out)?;
                Ok(IsNull::No)
            }
            (Value::Float(f), &Type::FLOAT4) => (*f as f32).to_sql(ty, out),
            (Value::Float(f), &Type::FLOAT8) => f.to_sql(ty, out),
            (Value::Float(f), &Type::NUMERIC) => {
                encode_numeric(&float_literal(*f), out)?;
                Ok(IsNull::No)
            }
            (Value::Text(s), &Type::NUMERIC) => {
                encode_numeric(s.trim(), out)?;
                Ok(IsNull::No)
            }
            (Value::Bytes(b), &Type::BYTEA) => b.to_sql(ty, out),
            (Value::Date(d), &Type::DATE) => d.to_sql(ty, out),
            (Value::Time(t), &Type::TIME) => t.to_sql(ty, out),
            (Value::DateTime(dt), &Type::TIMESTAMP) => dt.to_sql(ty, out),
            (Value::DateTime(dt), &Type::TIMESTAMPTZ) => dt.and_utc().to_sql(ty, out),
            (Value::TimestampTz(dt), &Type::TIMESTAMPTZ) => dt.to_sql(ty, out),
            (Value::TimestampTz(dt), &Type::TIMESTAMP) => dt.naive_utc().to_sql(ty, out),
            (Value::Json(j), &Type::JSON | &Type::JSONB) => j.to_sql(ty, out),
            _ => Err(mismatch(self, ty)),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn get<'a, T>(row: &'a Row, idx: usize, wrap: fn(T) -> Value) -> DriverResult<Value>
where
    T: FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx)
        .map(|v| v.map(wrap).unwrap_or(Value::Null))
        .map_err(|e| {
            let column = row.columns().get(idx).map(|c| c.name()).unwrap_or("?");
            DriverError::new("DataError", format!("cannot decode column {}: {}", column, e))
        })
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> DriverResult<Value> {
    match *pg_type {
        Type::BOOL => get::<bool>(row, idx, Value::Bool),
        Type::INT2 => get::<i16>(row, idx, |v| Value::Int(v.into())),
        Type::INT4 => get::<i32>(row, idx, |v| Value::Int(v.into())),
        Type::INT8 => get::<i64>(row, idx, Value::Int),
        Type::OID => get::<u32>(row, idx, |v| Value::Int(v.into())),
        Type::FLOAT4 => get::<f32>(row, idx, |v| Value::Float(v.into())),
        Type::FLOAT8 => get::<f64>(row, idx, Value::Float),
        Type::NUMERIC => get::<Numeric>(row, idx, |n| numeric_value(&n.0)),
        Type::BYTEA => get::<Vec<u8>>(row, idx, Value::Bytes),
        Type::DATE => get::<NaiveDate>(row, idx, Value::Date),
        Type::TIME => get::<NaiveTime>(row, idx, Value::Time),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx, Value::TimestampTz),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx, Value::Json),
        // Text types and anything else `String` can read; the rest is a DataError.
        _ => get::<String>(row, idx, Value::Text),
    }
}

/// Prepare first so statements without result columns report affected rows.
async fn run(client: &Client, sql: &str, params: &[Value]) -> DriverResult<VecCursor> {
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
    let statement = client.prepare(sql).await.map_err(|e| driver_error(&e))?;
    if statement.columns().is_empty() {
        let affected = client
            .execute(&statement, &refs)
            .await
            .map_err(|e| driver_error(&e))?;
        return Ok(VecCursor::affected(affected));
    }
    let description: Vec<String> = statement.columns().iter().map(|c| c.name().to_string()).collect();
    let rows = client
        .query(&statement, &refs)
        .await
        .map_err(|e| driver_error(&e))?;
    let affected = rows.len() as u64;
    let values = rows
        .iter()
        .map(|row| {
            row.columns()
                .iter()
                .enumerate()
                .map(|(i, col)| extract_value(row, i, col.type_()))
                .collect::<DriverResult<Vec<Value>>>()
        })
        .collect::<DriverResult<Vec<_>>>()?;
    Ok(VecCursor::new(description, values).with_rows_affected(affected))
}

/// A PostgreSQL session driven synchronously on its own runtime.
pub struct PgConnection {
    runtime: Runtime,
    client: Client,
    in_transaction: bool,
}

impl PgConnection {
    pub fn connect(config: &ConnectionConfig) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start runtime")?;
        debug!("connecting to {}", config.display_string());
        let client = runtime.block_on(create_client(config))?;
        Ok(Self {
            runtime,
            client,
            in_transaction: false,
        })
    }

    fn batch(&mut self, sql: &str) -> DriverResult<()> {
        self.runtime
            .block_on(self.client.batch_execute(sql))
            .map_err(|e| driver_error(&e))
    }
}

impl Connection for PgConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<Box<dyn Cursor>> {
        let cursor = self.runtime.block_on(run(&self.client, sql, params))?;
        Ok(Box::new(cursor))
    }

    fn begin(&mut self) -> DriverResult<()> {
        self.batch("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        let result = self.batch("ROLLBACK");
        self.in_transaction = false;
        result
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}
