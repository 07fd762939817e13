pub mod mime;
pub mod response;
pub mod upload;
