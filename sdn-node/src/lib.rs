pub mod checker;
pub mod config;
pub mod egress;
pub mod http;
pub mod kubernetes;
pub mod metrics;
pub mod monitor;
pub mod ovs;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("command output is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid flow: {0}")]
    InvalidFlow(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
