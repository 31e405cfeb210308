//! Integration tests of nrpc over tcp on the tokio runtime.
//!
//! Tests live under `src/tests` and share the [TestRunner] fixture, logs go to
//! `/tmp/nrpc_test.log`.

extern crate captains_log;
#[macro_use]
extern crate log;
pub use captains_log::logfn;
pub use nrpc_core::runtime::AsyncIO;

pub mod client;
pub mod server;
pub mod service;
#[cfg(test)]
mod tests;

use captains_log::*;
use rstest::*;
use std::fmt;
use std::future::Future;
use tokio::runtime::Runtime;

pub type RT = nrpc_tokio::TokioRT;

pub type Codec = nrpc_codec::JsonCodec;

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "")
    }
}

pub struct TestRunner {
    rt: Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/nrpc_test.log", Level::Trace).test().build().expect("log");
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .expect("runtime"),
        }
    }

    pub fn block_on<R, F: Future<Output = R>>(&self, f: F) -> R {
        self.rt.block_on(f)
    }
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new()
    }
}
