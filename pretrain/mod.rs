// SFS pretraining: fits the free size coordinates to an observed spectrum so the
// HMM fit starts near a sensible history.
pub mod optimizer;
pub mod oracle;
pub mod sfs;

pub use optimizer::{PretrainConfig, PretrainError, SfsPretrainer, pretrain};
pub use oracle::{OracleError, SfsOracle, T_MAX};
pub use sfs::{SfsError, cross_entropy, normalize_sfs, undistinguished_sfs};
