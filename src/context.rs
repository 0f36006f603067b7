use std::sync::{Arc, Mutex};
use crate::logging;

#[derive(Default)]
pub struct Context {
    pub log_level: logging::LogLevel,
    /// Print the raw timing window of every probed offset
    pub trace_samples: bool,
}

lazy_static::lazy_static!{
    static ref CONTEXT: Arc<Mutex<Context>> = Arc::new(Mutex::new(Context {
        trace_samples: true,
        ..Context::default()
    }));
}

pub fn access<F, R>(f: F) -> R
where
    F: FnOnce(&mut Context) -> R,
{
    // a poisoned lock still holds a usable context
    let mut guard = match CONTEXT.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}
