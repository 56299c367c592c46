#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Attribute macros building a tessel runtime around an async function.

mod entry;
mod parse;

/// Marks the async function whose body becomes the root future of a tessel
/// runtime. The function runs on core 0, the calling thread.
///
/// Note: This macro targets applications without special setup needs.
/// `runtime::Builder` exposes every knob.
///
/// # Arguments
///
/// - `cores = N`: number of reactor cores, defaults to one per allowed cpu.
/// - `backend = "epoll" | "uring"`: the kernel interface the reactors sleep
///   on, defaults to epoll.
///
/// Function arguments are NOT allowed.
///
/// # Usage
///
/// ```no_run
/// #[tessel::main(cores = 4)]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[tessel::main]`
///
/// ```no_run
/// fn main() {
///     tessel::runtime::Builder::new()
///         .cores(4)
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             println!("Hello world");
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Marks an async test. Each test gets its own runtime, with a single core
/// unless `cores` says otherwise.
///
/// ```no_run
/// #[tessel::test(cores = 2, backend = "uring")]
/// async fn my_test() {
///     assert_eq!(tessel::smp::count(), 2);
/// }
/// ```
///
/// Equivalent code not using `#[tessel::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     tessel::runtime::Builder::new()
///         .cores(2)
///         .backend(tessel::runtime::BackendKind::Uring)
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             assert_eq!(tessel::smp::count(), 2);
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
