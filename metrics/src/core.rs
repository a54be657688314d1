use std::{ops::Deref, sync::Mutex};

use prometheus_client::{encoding::text::encode, registry::Registry};

lazy_static! {
    pub(crate) static ref CORE: Core = Core::default();
}

#[derive(Default)]
pub(crate) struct Core {
    registry: Mutex<Registry>,
}

impl Core {
    pub fn register<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut Registry) -> T,
    {
        f(&mut self
            .registry
            .lock()
            .expect("should be able to acquire lock"))
    }

    pub(crate) fn registry(&self) -> impl Deref<Target = Registry> + '_ {
        self.registry
            .lock()
            .expect("should be able to acquire lock")
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = String::new();
        // Writing into a String cannot fail.
        let _ = encode(&mut buf, &self.registry());
        buf.into()
    }
}
