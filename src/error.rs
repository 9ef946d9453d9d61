use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error {0}")]
    IO(#[from] io::Error),
    #[error("Arg parse error {0}")]
    ArgError(#[from] clap::Error),

    #[error("Failed to parse settings: {0}")]
    Settings(String),
    #[error("Unknown service: \"{0}\"")]
    UnknownService(String),
}

pub type Result<T> = std::result::Result<T, Error>;
