use anyhow::anyhow;
use std::any::Any;

/// Try to figure out what's in the panic payload
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
