//! Semantic column types.
//!
//! Declarations spell types as text (`varchar(255)`, `numeric(10, 2)`,
//! `text[]`, `vector(1536)`). The spelling is parsed once into [`ColumnType`]
//! so that the differ compares variants rather than strings, and the DDL
//! generator maps each variant through a fixed native-type table.
//!
//! Spellings the parser does not recognise become [`ColumnType::Unknown`];
//! they survive serialization unchanged and fail at generation time.

use std::collections::BTreeSet;
use std::fmt;

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map_res, opt, recognize},
    multi::{many0, separated_list1},
    sequence::{delimited, preceded, terminated},
    IResult,
};
use serde::{Deserialize, Serialize};

/// A column's semantic type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ColumnType {
    SmallInt,
    Integer,
    BigInt,
    Serial,
    BigSerial,
    Real,
    Double,
    /// `numeric` with optional `(precision, scale)`
    Numeric(Option<(u32, u32)>),
    Boolean,
    Char(u32),
    /// `varchar` with optional length; unbounded when `None`
    Varchar(Option<u32>),
    Text,
    Uuid,
    Json,
    Jsonb,
    Date,
    Time,
    Timestamp,
    Timestamptz,
    Bytea,
    /// pgvector embedding with fixed dimensions
    Vector(u32),
    Array(Box<ColumnType>),
    Unknown(String),
}

impl ColumnType {
    /// Parse a type spelling. Never fails: unrecognised input is kept verbatim
    /// as [`ColumnType::Unknown`].
    pub fn parse(input: &str) -> Self {
        let normalized = input.trim().to_ascii_lowercase();
        match all_consuming(terminated(parse_column_type, multispace0))(normalized.as_str()) {
            Ok((_, Some(ty))) => ty,
            _ => ColumnType::Unknown(input.trim().to_string()),
        }
    }

    /// Type family used by configurable widening pairs (`varchar`, `int[]`...).
    pub fn family(&self) -> String {
        match self {
            ColumnType::Array(inner) => format!("{}[]", inner.family()),
            ColumnType::Unknown(name) => name.clone(),
            other => other.base_name().to_string(),
        }
    }

    fn base_name(&self) -> &'static str {
        match self {
            ColumnType::SmallInt => "smallint",
            ColumnType::Integer => "integer",
            ColumnType::BigInt => "bigint",
            ColumnType::Serial => "serial",
            ColumnType::BigSerial => "bigserial",
            ColumnType::Real => "real",
            ColumnType::Double => "double",
            ColumnType::Numeric(_) => "numeric",
            ColumnType::Boolean => "boolean",
            ColumnType::Char(_) => "char",
            ColumnType::Varchar(_) => "varchar",
            ColumnType::Text => "text",
            ColumnType::Uuid => "uuid",
            ColumnType::Json => "json",
            ColumnType::Jsonb => "jsonb",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Timestamptz => "timestamptz",
            ColumnType::Bytea => "bytea",
            ColumnType::Vector(_) => "vector",
            ColumnType::Array(_) => "array",
            ColumnType::Unknown(_) => "unknown",
        }
    }

    /// Native PostgreSQL type for `CREATE TABLE` / `ADD COLUMN`.
    ///
    /// Returns `None` for unknown types and for arrays of serial types.
    pub fn native_type(&self) -> Option<String> {
        let native = match self {
            ColumnType::SmallInt => "smallint".to_string(),
            ColumnType::Integer => "integer".to_string(),
            ColumnType::BigInt => "bigint".to_string(),
            ColumnType::Serial => "serial".to_string(),
            ColumnType::BigSerial => "bigserial".to_string(),
            ColumnType::Real => "real".to_string(),
            ColumnType::Double => "double precision".to_string(),
            ColumnType::Numeric(None) => "numeric".to_string(),
            ColumnType::Numeric(Some((p, s))) => format!("numeric({}, {})", p, s),
            ColumnType::Boolean => "boolean".to_string(),
            ColumnType::Char(n) => format!("char({})", n),
            ColumnType::Varchar(None) => "varchar".to_string(),
            ColumnType::Varchar(Some(n)) => format!("varchar({})", n),
            ColumnType::Text => "text".to_string(),
            ColumnType::Uuid => "uuid".to_string(),
            ColumnType::Json => "json".to_string(),
            ColumnType::Jsonb => "jsonb".to_string(),
            ColumnType::Date => "date".to_string(),
            ColumnType::Time => "time".to_string(),
            ColumnType::Timestamp => "timestamp".to_string(),
            ColumnType::Timestamptz => "timestamptz".to_string(),
            ColumnType::Bytea => "bytea".to_string(),
            ColumnType::Vector(dims) => format!("vector({})", dims),
            ColumnType::Array(inner) => match inner.as_ref() {
                ColumnType::Serial | ColumnType::BigSerial => return None,
                other => format!("{}[]", other.native_type()?),
            },
            ColumnType::Unknown(_) => return None,
        };
        Some(native)
    }

    /// Native type for `ALTER COLUMN ... SET DATA TYPE`, where serial
    /// pseudo-types are not accepted and map to their storage type.
    pub fn storage_type(&self) -> Option<String> {
        match self {
            ColumnType::Serial => Some("integer".to_string()),
            ColumnType::BigSerial => Some("bigint".to_string()),
            other => other.native_type(),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Numeric(Some((p, s))) => write!(f, "numeric({},{})", p, s),
            ColumnType::Char(n) => write!(f, "char({})", n),
            ColumnType::Varchar(Some(n)) => write!(f, "varchar({})", n),
            ColumnType::Vector(dims) => write!(f, "vector({})", dims),
            ColumnType::Array(inner) => write!(f, "{}[]", inner),
            ColumnType::Unknown(name) => f.write_str(name),
            other => f.write_str(other.base_name()),
        }
    }
}

impl From<String> for ColumnType {
    fn from(s: String) -> Self {
        ColumnType::parse(&s)
    }
}

impl From<&str> for ColumnType {
    fn from(s: &str) -> Self {
        ColumnType::parse(s)
    }
}

impl From<ColumnType> for String {
    fn from(ty: ColumnType) -> Self {
        ty.to_string()
    }
}

/// Parse `base[(args)][[]...]`. Yields `None` when the base name is not a
/// known semantic type.
fn parse_column_type(input: &str) -> IResult<&str, Option<ColumnType>> {
    let (input, base) = parse_base_type(input)?;
    let (input, dims) = many0(preceded(multispace0, tag("[]")))(input)?;
    let ty = base.map(|b| {
        dims.into_iter()
            .fold(b, |inner, _| ColumnType::Array(Box::new(inner)))
    });
    Ok((input, ty))
}

fn parse_base_type(input: &str) -> IResult<&str, Option<ColumnType>> {
    let (input, _) = multispace0(input)?;
    let (input, name) = parse_type_name(input)?;
    let (input, args) = opt(preceded(multispace0, parse_type_args))(input)?;
    Ok((input, build_type(name, args.as_deref())))
}

/// Type names may span several words (`double precision`,
/// `timestamp with time zone`).
fn parse_type_name(input: &str) -> IResult<&str, &str> {
    recognize(separated_list1(
        multispace1,
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

/// Parse `(n)` or `(p, s)`.
fn parse_type_args(input: &str) -> IResult<&str, Vec<u32>> {
    delimited(
        char('('),
        separated_list1(
            char(','),
            delimited(multispace0, map_res(digit1, str::parse::<u32>), multispace0),
        ),
        char(')'),
    )(input)
}

fn build_type(name: &str, args: Option<&[u32]>) -> Option<ColumnType> {
    let ty = match (name, args) {
        ("smallint" | "int2", None) => ColumnType::SmallInt,
        ("integer" | "int" | "int4", None) => ColumnType::Integer,
        ("bigint" | "int8", None) => ColumnType::BigInt,
        ("serial" | "serial4", None) => ColumnType::Serial,
        ("bigserial" | "serial8", None) => ColumnType::BigSerial,
        ("real" | "float4", None) => ColumnType::Real,
        ("double" | "double precision" | "float8", None) => ColumnType::Double,
        ("numeric" | "decimal", None) => ColumnType::Numeric(None),
        ("numeric" | "decimal", Some([p])) => ColumnType::Numeric(Some((*p, 0))),
        ("numeric" | "decimal", Some([p, s])) => ColumnType::Numeric(Some((*p, *s))),
        ("boolean" | "bool", None) => ColumnType::Boolean,
        ("char" | "character", None) => ColumnType::Char(1),
        ("char" | "character", Some([n])) => ColumnType::Char(*n),
        ("varchar" | "character varying", None) => ColumnType::Varchar(None),
        ("varchar" | "character varying", Some([n])) => ColumnType::Varchar(Some(*n)),
        ("text", None) => ColumnType::Text,
        ("uuid", None) => ColumnType::Uuid,
        ("json", None) => ColumnType::Json,
        ("jsonb", None) => ColumnType::Jsonb,
        ("date", None) => ColumnType::Date,
        ("time" | "time without time zone", None) => ColumnType::Time,
        ("timestamp" | "timestamp without time zone", None) => ColumnType::Timestamp,
        ("timestamptz" | "timestamp with time zone", None) => ColumnType::Timestamptz,
        ("bytea", None) => ColumnType::Bytea,
        ("vector", Some([dims])) => ColumnType::Vector(*dims),
        _ => return None,
    };
    Some(ty)
}

/// Which column type changes count as information-preserving widenings.
///
/// The built-in table covers integer/float/numeric/character widenings and
/// element-wise array widenings. Extra family pairs (for example
/// `("json", "jsonb")`) can be allowed from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WideningRules {
    extra: BTreeSet<(String, String)>,
}

impl WideningRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additionally allow changing any `from` family type into any `to` family type.
    pub fn allow(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.extra.insert((from.into(), to.into()));
        self
    }

    pub fn is_safe(&self, from: &ColumnType, to: &ColumnType) -> bool {
        if from == to || self.extra.contains(&(from.family(), to.family())) {
            return true;
        }
        use ColumnType::*;
        match (from, to) {
            (SmallInt, Integer | BigInt | Numeric(None)) => true,
            (SmallInt, Numeric(Some((p, s)))) => p.saturating_sub(*s) >= 5,
            (Integer, BigInt | Numeric(None)) => true,
            (Integer, Numeric(Some((p, s)))) => p.saturating_sub(*s) >= 10,
            (BigInt, Numeric(None)) => true,
            (BigInt, Numeric(Some((p, s)))) => p.saturating_sub(*s) >= 19,
            (Serial, BigSerial | Integer | BigInt) => true,
            (BigSerial, BigInt) => true,
            (Real, Double) => true,
            (Numeric(Some(_)), Numeric(None)) => true,
            (Numeric(Some((p, s))), Numeric(Some((p2, s2)))) => {
                s2 >= s && p2.saturating_sub(*s2) >= p.saturating_sub(*s)
            }
            (Char(n), Char(m)) => m >= n,
            (Char(n), Varchar(Some(m))) => m >= n,
            (Char(_), Varchar(None) | Text) => true,
            (Varchar(Some(n)), Varchar(Some(m))) => m >= n,
            (Varchar(_), Varchar(None) | Text) => true,
            (Text, Varchar(None)) => true,
            (Array(a), Array(b)) => self.is_safe(a, b),
            _ => false,
        }
    }
}
