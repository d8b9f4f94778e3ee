pub mod catalog;
pub mod commit_bus;
pub mod frame;
pub mod id_file;
pub mod meta;
pub mod registry;
pub mod segment;
pub mod sequencer;
