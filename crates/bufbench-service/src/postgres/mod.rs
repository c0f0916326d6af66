//! PostgreSQL implementations of the orchestration seams, driven through
//! the server's own command-line tools.

mod capacity;
mod pgbench;
mod provisioner;
mod psql;

pub use capacity::{parse_shared_buffers_gb, PostgresCapacity};
pub use pgbench::PgbenchLauncher;
pub use provisioner::PostgresProvisioner;
pub use psql::{quote_ident, quote_literal, run_tool, PsqlClient, ToolError};
