//! Unit tests for the client runtime.

mod support;
