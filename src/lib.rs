pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod decode;
pub mod health;
pub mod ingest;
pub mod producer;
pub mod retry;
pub mod sink;
pub mod trace;
pub mod window;
