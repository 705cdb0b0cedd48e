pub mod archive;
pub mod artifact;
pub mod backup_config;
pub mod checksum;
pub mod compress;
pub mod database;
pub mod encrypt;
pub mod file_ext;
pub mod layout;
pub mod logging;
pub mod notifications;
pub mod orchestrator;
pub mod pipeline;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod signal;
pub mod split;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
