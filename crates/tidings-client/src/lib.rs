pub mod converter;
pub mod session;
pub mod transport;
pub mod writer;

pub use converter::HtmdConverter;
pub use session::{SessionConfig, SessionPool};
pub use transport::ReqwestTransport;
pub use writer::FsArticleWriter;
