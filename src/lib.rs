//! Coverage-guided fuzzer for the exported activities and broadcast
//! receivers of an Android app, delivering intents through adb and reading
//! edge coverage from an on-device agent.

pub mod adb_device;
pub mod adb_executor;
pub mod corpus;
pub mod coverage_map;
pub mod error;
pub mod fuzzer;
pub mod intent_generator;
pub mod intent_input;
pub mod intent_mutator;
pub mod intent_template;
pub mod socket_coverage_collector;
pub mod util;

#[cfg(test)]
mod testing;
