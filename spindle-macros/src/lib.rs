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

//! Entry point macros for the spindle scheduler.

mod entry;
mod parse;

/// Marks an async function to be driven by a new scheduler. This macro sets up
/// a `Scheduler` without requiring the user to use `Builder` directly.
///
/// The function body runs through `Scheduler::block_on` on the calling thread,
/// not on a worker: it is expected to spawn the real work. Once the body
/// returns, the scheduler is shut down and every task still alive is
/// cancelled.
///
/// Function arguments are NOT allowed.
///
/// # Options
///
/// - `worker_threads = N`: number of worker threads. Defaults to one less than
///   the number of cores, or the `SPINDLE_WORKER_THREADS` environment variable.
/// - `dispatch = "round_robin" | "least_loaded" | "shared"`: how tasks without
///   affinity are assigned a run queue. Defaults to `round_robin`.
///
/// # Usage
///
/// ```no_run
/// #[spindle::main(worker_threads = 2, dispatch = "least_loaded")]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[spindle::main]`
///
/// ```no_run
/// fn main() {
///     let scheduler = spindle::runtime::Builder::new()
///         .worker_threads(2)
///         .dispatch(spindle::runtime::Dispatch::LeastLoaded)
///         .try_build()
///         .unwrap();
///
///     scheduler.block_on(async {
///         println!("Hello world");
///     });
///
///     scheduler.shutdown().unwrap();
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Marks an async function to be run as a test on its own scheduler.
///
/// Each test gets a new scheduler, shut down when the test body returns. It
/// takes the same options as [`macro@main`].
///
/// ```no_run
/// #[spindle::test(worker_threads = 1)]
/// async fn my_test() {
///     let answer = spindle::spawn(async { 42 }).await;
///     assert_eq!(answer, Ok(42));
/// }
/// ```
///
/// Equivalent code not using `#[spindle::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     let scheduler = spindle::runtime::Builder::new()
///         .worker_threads(1)
///         .try_build()
///         .unwrap();
///
///     scheduler.block_on(async {
///         let answer = spindle::spawn(async { 42 }).await;
///         assert_eq!(answer, Ok(42));
///     });
///
///     scheduler.shutdown().unwrap();
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
