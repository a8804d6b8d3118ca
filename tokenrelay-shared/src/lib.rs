#![cfg_attr(not(test), forbid(unsafe_code))]

//! Types shared by every TokenRelay process: the token envelope and its codec, the chat
//! request models, and configuration loading.

pub mod config;
pub mod models;
