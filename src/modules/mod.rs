pub mod transcoding;
