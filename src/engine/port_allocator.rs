//! Port Allocator (C): reserves an OS-assigned ephemeral port and tracks it
//! in an in-memory set so concurrent bridge launches never collide.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::XrayError;

const MAX_ATTEMPTS: u32 = 10;

pub trait PortAllocator: Send + Sync {
    fn allocate(&self) -> Result<u16, XrayError>;
    fn release(&self, port: u16);
}

#[derive(Default)]
pub struct OsPortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

impl OsPortAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl PortAllocator for OsPortAllocator {
    fn allocate(&self) -> Result<u16, XrayError> {
        for _ in 0..MAX_ATTEMPTS {
            let port = match TcpListener::bind(("127.0.0.1", 0)) {
                Ok(listener) => listener.local_addr().map(|a| a.port()).ok(),
                Err(_) => None,
            };
            // the listener is dropped here, releasing the socket back to the OS
            let Some(port) = port else { continue };

            let mut reserved = self.reserved.lock();
            if reserved.insert(port) {
                return Ok(port);
            }
            // someone else grabbed it between bind and reserve; try again
        }
        Err(XrayError::PortExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    fn release(&self, port: u16) {
        self.reserved.lock().remove(&port);
    }
}
