pub mod assets;
pub mod config;
pub mod error;
pub mod history;
pub mod inspect;
pub mod links;
pub mod page_file;
pub mod publish;
pub mod reconcile;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod tree;
pub mod vcs;
pub mod watermark;
pub mod wikijs;

#[cfg(test)]
pub(crate) mod testing;
