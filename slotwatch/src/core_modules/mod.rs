pub mod annotate;
pub mod classifiers;
pub mod ensemble;
pub mod filters;
pub mod geometry;
pub mod grid_session;
pub mod region;
pub mod slot_state;
