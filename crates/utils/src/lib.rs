pub mod clock;
pub mod log;
pub mod response;
pub mod storage;
