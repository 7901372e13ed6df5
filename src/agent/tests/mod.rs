//! Unit tests for agents and push fan-out.
