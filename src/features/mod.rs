pub mod codec;
pub mod connectivity;
pub mod endpoint;
pub mod pdf;
pub mod record_store;
pub mod records;
pub mod storage;
pub mod sync;
