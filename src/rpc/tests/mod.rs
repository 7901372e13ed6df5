//! Protocol tests over loopback channels.
