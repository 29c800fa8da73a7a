pub(crate) mod retry;
pub(crate) mod runnable;
