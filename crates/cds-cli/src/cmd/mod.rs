pub mod action;
pub mod catalog;
pub mod config;
pub mod init;
pub mod plugin;
pub mod run;
