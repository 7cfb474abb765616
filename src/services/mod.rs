pub mod fleet;
pub mod master;
pub mod provisioner;

#[cfg(test)]
pub(crate) mod fakes;
