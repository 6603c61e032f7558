pub mod cancel;
pub mod error;
pub mod limiters;

pub use cancel::CancelFlag;
pub use error::ApiError;
pub use limiters::Limiters;
