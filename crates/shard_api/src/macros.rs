/// Exports a shard archive's entry points.
///
/// Generates the two C symbols the host looks up in every native archive:
///
/// - `frost_shard_abi_version`: the NUL-terminated [`ABI_VERSION`](crate::ABI_VERSION)
///   this archive was built against
/// - `frost_shard_exports`: a boxed [`ExportTable`](crate::ExportTable) built by
///   the given expression
///
/// Panics while building the table are caught at the FFI boundary and reported
/// to the host as a null table.
///
/// # Example
///
/// ```rust,ignore
/// use shard_api::*;
///
/// export_shard!(ExportTable::new()
///     .with_descriptor(include_str!("../shard.toml"))
///     .with_factory(MyFactory)
///     .with_command(MyCommand));
/// ```
#[macro_export]
macro_rules! export_shard {
    ($table:expr) => {
        /// ABI string of the shard API this archive was compiled against.
        #[no_mangle]
        pub extern "C" fn frost_shard_abi_version() -> *const ::std::os::raw::c_char {
            $crate::ABI_VERSION_NUL.as_ptr() as *const ::std::os::raw::c_char
        }

        /// Builds this archive's export table. Ownership passes to the caller.
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn frost_shard_exports() -> *mut $crate::ExportTable {
            // Critical: a panic must not unwind across the C boundary
            match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(
                || -> $crate::ExportTable { $table },
            )) {
                Ok(table) => ::std::boxed::Box::into_raw(::std::boxed::Box::new(table)),
                Err(panic) => {
                    eprintln!(
                        "shard export table construction panicked: {}",
                        $crate::panic_message(panic.as_ref())
                    );
                    ::std::ptr::null_mut()
                }
            }
        }
    };
}
