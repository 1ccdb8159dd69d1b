use thiserror::Error;

use crate::cluster::meta_client::FindError;
use crate::cluster::signal::Interrupted;
use crate::net::NetError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the per-module errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Find(#[from] FindError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}
