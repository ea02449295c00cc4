pub mod base {
    pub mod behavior;
}
pub mod mem;
pub mod policy;
pub mod sim {
    pub mod config;
    pub mod perf_log;
    pub mod top;
}
pub mod timeq;
pub mod traffic {
    pub mod config;
    pub mod driver;
    pub mod patterns;
}
