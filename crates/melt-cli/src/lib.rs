pub mod cli;

mod commands;
mod logging;
