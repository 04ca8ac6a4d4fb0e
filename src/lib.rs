mod error;
pub use error::{
    BackendError,
    ChainError,
    ChainResult,
};

mod assertion;
pub use assertion::Assertion;

mod chain;
pub use chain::{
    AssertionChain,
    FastConfirmer,
};

mod challenge;
pub use challenge::{
    ChallengeConstants,
    SpecChallengeManager,
    SpecEdge,
};

mod fast_confirm;
pub use fast_confirm::FastConfirmSafe;

pub mod backend;

pub mod bindings;

pub mod config;

pub mod primitives;

pub mod transact;

pub mod utils;

#[cfg(any(test, feature = "test"))]
pub mod test_utils;
