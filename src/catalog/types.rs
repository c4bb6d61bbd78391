use serde::{Deserialize, Serialize};
use std::fmt;

pub type DbId = u64;
pub type TableId = u64;
pub type IndexId = u64;
pub type JobId = u64;
pub type TxnId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    LargeInt,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Date,
    Datetime,
    Char(u16),
    Varchar(u32),
}

impl ColumnType {
    /// Floating point columns cannot be part of a sort key.
    pub fn can_be_key(self) -> bool {
        !matches!(self, ColumnType::Float | ColumnType::Double)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "BOOLEAN"),
            ColumnType::TinyInt => write!(f, "TINYINT"),
            ColumnType::SmallInt => write!(f, "SMALLINT"),
            ColumnType::Int => write!(f, "INT"),
            ColumnType::BigInt => write!(f, "BIGINT"),
            ColumnType::LargeInt => write!(f, "LARGEINT"),
            ColumnType::Float => write!(f, "FLOAT"),
            ColumnType::Double => write!(f, "DOUBLE"),
            ColumnType::Decimal { precision, scale } => write!(f, "DECIMAL({precision},{scale})"),
            ColumnType::Date => write!(f, "DATE"),
            ColumnType::Datetime => write!(f, "DATETIME"),
            ColumnType::Char(len) => write!(f, "CHAR({len})"),
            ColumnType::Varchar(len) => write!(f, "VARCHAR({len})"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TableEngine {
    #[default]
    Olap,
    Mysql,
    Broker,
}

impl TableEngine {
    pub fn supports_alter(self) -> bool {
        matches!(self, TableEngine::Olap)
    }
}

impl fmt::Display for TableEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Native tables report the engine under the product name.
            TableEngine::Olap => write!(f, "StarRocks"),
            TableEngine::Mysql => write!(f, "MYSQL"),
            TableEngine::Broker => write!(f, "BROKER"),
        }
    }
}
