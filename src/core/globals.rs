use lazy_static::lazy_static;
use tokio::runtime::{Builder, Runtime};

lazy_static! {
    /// Runtime that owns every background scan operation.
    ///
    /// Callers do not need a runtime of their own: sessions spawn onto this one
    /// and hand back plain handles.
    pub static ref TOKIO_RUNTIME: Runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("ptrscan-worker")
        .build()
        .expect("failed to build the scan runtime");
}
