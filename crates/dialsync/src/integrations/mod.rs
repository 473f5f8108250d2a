pub mod loopback;

pub use loopback::LoopbackHub;
