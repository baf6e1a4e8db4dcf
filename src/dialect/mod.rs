//! Dialect capabilities.
//!
//! The planner does not render SQL, but some query shapes are only legal on
//! databases that support them. Each dialect implements [`SqlCapabilities`];
//! the planner consults it and rejects unsupported shapes up front.
//!
//! | Feature | PostgreSQL | MySQL | SQL Server | SQLite | DuckDB |
//! |---------|-----------|-------|------------|--------|--------|
//! | LATERAL joins | ✓ | 8.0.14+ | ❌ (APPLY) | ❌ | ✓ |
//! | RIGHT JOIN | ✓ | ✓ | ✓ | 3.39+ | ✓ |
//! | FULL OUTER JOIN | ✓ | ❌ | ✓ | 3.39+ | ✓ |
//! | Named windows | ✓ | 8.0+ | ❌ | ✓ | ✓ |
//! | Recursive CTE | ✓ | 8.0+ | ✓ | ✓ | ✓ |
//! | Row locks | ✓ | ✓ | hints | ❌ | ❌ |

use std::fmt;
use std::str::FromStr;

/// Capability flags consulted during planning.
///
/// The default implementations describe a fully featured database.
pub trait SqlCapabilities: fmt::Debug + Send + Sync {
    /// Dialect name for display/logging.
    fn name(&self) -> &'static str;

    /// Whether this dialect supports LATERAL joins.
    fn supports_lateral(&self) -> bool {
        true
    }

    fn supports_right_join(&self) -> bool {
        true
    }

    /// Whether this dialect supports FULL OUTER JOIN.
    fn supports_full_outer_join(&self) -> bool {
        true
    }

    /// Whether a query may declare a `WINDOW` clause.
    fn supports_named_windows(&self) -> bool {
        true
    }

    fn supports_recursive_cte(&self) -> bool {
        true
    }

    /// Whether `FOR UPDATE`-style locks are accepted.
    fn supports_row_locks(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Postgres;

impl SqlCapabilities for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MySql;

impl SqlCapabilities for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn supports_full_outer_join(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TSql;

impl SqlCapabilities for TSql {
    fn name(&self) -> &'static str {
        "tsql"
    }

    fn supports_lateral(&self) -> bool {
        // T-SQL uses CROSS APPLY / OUTER APPLY instead
        false
    }

    fn supports_named_windows(&self) -> bool {
        false
    }

    fn supports_row_locks(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sqlite;

impl SqlCapabilities for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_lateral(&self) -> bool {
        false
    }

    fn supports_row_locks(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DuckDb;

impl SqlCapabilities for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn supports_row_locks(&self) -> bool {
        false
    }
}

/// Supported dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Postgres,
    MySql,
    TSql,
    Sqlite,
    DuckDb,
}

impl Dialect {
    /// Get the dialect implementation.
    pub fn capabilities(&self) -> &'static dyn SqlCapabilities {
        match self {
            Dialect::Postgres => &Postgres,
            Dialect::MySql => &MySql,
            Dialect::TSql => &TSql,
            Dialect::Sqlite => &Sqlite,
            Dialect::DuckDb => &DuckDb,
        }
    }
}

// Delegate to the concrete dialect
impl SqlCapabilities for Dialect {
    fn name(&self) -> &'static str {
        self.capabilities().name()
    }

    fn supports_lateral(&self) -> bool {
        self.capabilities().supports_lateral()
    }

    fn supports_right_join(&self) -> bool {
        self.capabilities().supports_right_join()
    }

    fn supports_full_outer_join(&self) -> bool {
        self.capabilities().supports_full_outer_join()
    }

    fn supports_named_windows(&self) -> bool {
        self.capabilities().supports_named_windows()
    }

    fn supports_recursive_cte(&self) -> bool {
        self.capabilities().supports_recursive_cte()
    }

    fn supports_row_locks(&self) -> bool {
        self.capabilities().supports_row_locks()
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error parsing a dialect name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown dialect: {0}")]
pub struct UnknownDialect(pub String);

impl FromStr for Dialect {
    type Err = UnknownDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "tsql" | "mssql" | "sqlserver" => Ok(Dialect::TSql),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            "duckdb" => Ok(Dialect::DuckDb),
            other => Err(UnknownDialect(other.to_string())),
        }
    }
}
