pub mod bus;
pub mod cache;
pub mod controller;
pub mod device;
pub mod devices;
pub mod error;
pub mod factory;
pub mod image;
pub mod registry;
#[cfg(feature = "savestates")]
pub mod savestate;
pub mod types;
pub mod util;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn build_version() -> String {
    if built_info::GIT_COMMIT_HASH_SHORT.is_some() {
        format!(
            "{}-{}{}",
            built_info::PKG_VERSION,
            built_info::GIT_COMMIT_HASH_SHORT.unwrap(),
            if built_info::GIT_DIRTY.unwrap_or(false) {
                "-dirty"
            } else {
                ""
            }
        )
    } else {
        built_info::PKG_VERSION.to_string()
    }
}
