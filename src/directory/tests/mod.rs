//! Unit tests for the directory service.

mod support;
