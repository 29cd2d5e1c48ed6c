//! An embeddable runtime for cooperatively scheduled bytecode tasks.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

pub use sol_lang::*;

#[cfg(feature = "channel")]
pub use sol_channel as channel;
#[cfg(feature = "reactor")]
pub use sol_reactor as reactor;
