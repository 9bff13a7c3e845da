pub mod cluster;
pub mod msearch;
pub mod request;

pub use cluster::{run_ping, run_sniff};
pub use msearch::run_msearch;
pub use request::run_request;
