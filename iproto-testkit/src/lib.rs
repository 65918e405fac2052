// iproto-testkit - In-process mock instance for client tests
//
// Speaks enough of the binary protocol to drive the client end to end:
// greeting, ID, AUTH, PING, CALL/EVAL, DML on in-memory spaces, system-space
// schema selects, watchers, and schema-version checks.

mod dispatch;
pub mod instance;
pub mod space;

pub use dispatch::ER_NO_SUCH_PROC;
pub use instance::{Handler, InstanceBuilder, MockInstance, Reply};
pub use space::{MockSpace, ER_NO_SUCH_FIELD, ER_TUPLE_FOUND};

use tracing_subscriber::EnvFilter;

/// Installs a test subscriber honouring `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}
