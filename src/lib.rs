#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod address;
pub mod backend;
pub mod cli;
pub mod config;
pub mod creds;
pub mod domain_xml;
pub mod error;
pub mod init;
pub mod instance;
pub mod inventory;
pub mod lock;
pub mod logging;
pub mod macaddrs;
pub mod metadata;
pub mod network;
pub mod paths;
pub mod power;
pub mod ssh;
pub mod tools;
pub mod util;

#[cfg(test)]
mod test_support;
