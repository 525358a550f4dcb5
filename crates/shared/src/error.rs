use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address has an empty bare part")]
    Empty,
    #[error("address has an empty resource part")]
    EmptyResource,
}
