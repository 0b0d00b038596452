pub mod engine;
pub mod recorder;
pub mod upgrade;
pub mod upstream;

pub use engine::ReverseProxy;
pub use upstream::UpstreamProxyPool;
