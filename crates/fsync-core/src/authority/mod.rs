//! The coordinating authority: allocates handles and shared slots and
//! resolves named-object collisions.
//!
//! This process only talks to it through [`Authority`]. Transport failures
//! are `Err`; the authority's own verdict is the [`Reply`] status.

mod framed;
mod memory;
pub mod protocol;

use std::sync::Arc;

use fsync_error::Result;
use fsync_types::Handle;

pub use framed::{FramedAuthority, serve_connection};
pub use memory::MemoryAuthority;
pub use protocol::{CreateRequest, QueryRequest, Reply};

pub trait Authority: Send + Sync {
    /// Create an object, or open the existing one with the same name.
    fn create_fsync(&self, request: &CreateRequest) -> Result<Reply>;

    /// Look up the slot and type bound to `handle`.
    fn query_object(&self, handle: Handle) -> Result<Reply>;
}

impl<A: Authority + ?Sized> Authority for Arc<A> {
    fn create_fsync(&self, request: &CreateRequest) -> Result<Reply> {
        (**self).create_fsync(request)
    }

    fn query_object(&self, handle: Handle) -> Result<Reply> {
        (**self).query_object(handle)
    }
}

impl<A: Authority + ?Sized> Authority for &A {
    fn create_fsync(&self, request: &CreateRequest) -> Result<Reply> {
        (**self).create_fsync(request)
    }

    fn query_object(&self, handle: Handle) -> Result<Reply> {
        (**self).query_object(handle)
    }
}
