pub mod error;
pub mod requests;
pub mod responses;

pub use error::{ClientError, Result};
pub use requests::{IteratorType, Request, RequestCode, RequestId, Tuple};
pub use responses::Response;
