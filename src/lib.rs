//! The Scrolling Screenshot Stitcher core.
//!
//! Five cooperating components, leaf to root: [`source`] (the external
//! Frame Source collaborator), [`comparator`] (frame classification),
//! [`canvas`] (the growing composite image), [`scheduler`] (capture
//! cadence), and [`controller`] (the session state machine that drives all
//! four). [`session`] wires them into the public Session API.
//!
//! Everything this crate deliberately does not do — screen capture itself,
//! annotation, clipboard/file persistence, UI chrome, hotkeys — lives
//! outside it.

pub mod canvas;
pub mod comparator;
pub mod controller;
pub mod error;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod types;
