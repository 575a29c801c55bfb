#![forbid(unsafe_code)]

pub mod hash;

pub mod agreement;

pub mod cipher;
pub mod envelope;

#[cfg(test)]
mod proptests;
