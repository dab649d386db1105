//! Expansion of the `#[spindle::main]` and `#[spindle::test]` attributes.
//!
//! Both attributes turn an `async fn` into a plain function that builds a
//! scheduler, blocks on the original body and shuts the scheduler down:
//!
//! ```rust,ignore
//! #[spindle::main(worker_threads = 2, dispatch = "least_loaded")]
//! async fn main() {
//!     println!("Hello world");
//! }
//! ```
//!
//! expands to roughly
//!
//! ```rust,ignore
//! fn main() {
//!     let body = async { println!("Hello world"); };
//!     let scheduler = spindle::runtime::Builder::new()
//!         .worker_threads(2)
//!         .dispatch(spindle::runtime::Dispatch::LeastLoaded)
//!         .try_build()
//!         .expect("Failed building the Scheduler");
//!     let output = scheduler.block_on(body);
//!     scheduler.shutdown().expect("Failed shutting down the Scheduler");
//!     return output;
//! }
//! ```
use proc_macro2::{Span, TokenStream};
use quote::{ToTokens, quote, quote_spanned};
use syn::ItemFn;
use syn::parse::Parser;

use crate::parse::*;

type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const OPTIONS: &str = "expected one of: `worker_threads`, `dispatch`";

#[derive(Clone, Copy)]
enum Entry {
    Main,
    Test,
}

impl Entry {
    fn name(self) -> &'static str {
        match self {
            Entry::Main => "spindle::main",
            Entry::Test => "spindle::test",
        }
    }
}

pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    expand(Entry::Main, args, item)
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    expand(Entry::Test, args, item)
}

/// On a bad argument the function is still expanded with the default config
/// next to the compile error, so IDE tooling keeps seeing a valid item.
fn expand(entry: Entry, args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    match check_signature(entry, &input).and_then(|()| Config::parse(entry, args)) {
        Ok(config) => expand_fn(input, entry, config),
        Err(e) => token_stream_with_error(expand_fn(input, entry, Config::default()), e),
    }
}

fn check_signature(entry: Entry, input: &ItemFn) -> Result<(), syn::Error> {
    if input.sig.asyncness.is_none() {
        let msg = "the `async` keyword is missing from the function declaration";
        return Err(syn::Error::new_spanned(input.sig.fn_token, msg));
    }

    match entry {
        Entry::Main if input.sig.ident == "main" && !input.sig.inputs.is_empty() => Err(
            syn::Error::new_spanned(&input.sig.ident, "the main function cannot accept arguments"),
        ),
        Entry::Test => match input.attrs.iter().find(|attr| is_test_attribute(attr)) {
            Some(attr) => Err(syn::Error::new_spanned(
                attr,
                "`#[spindle::test]` already adds `#[test]`, remove the second test attribute",
            )),
            None => Ok(()),
        },
        Entry::Main => Ok(()),
    }
}

#[derive(Default)]
struct Config {
    worker_threads: Option<usize>,
    dispatch: Option<TokenStream>,
}

impl Config {
    fn parse(entry: Entry, args: TokenStream) -> Result<Config, syn::Error> {
        let mut config = Config::default();

        for arg in AttributeArgs::parse_terminated.parse2(args)? {
            let syn::Meta::NameValue(option) = &arg else {
                let msg = format!(
                    "`{}` options are written `name = value`, {OPTIONS}",
                    entry.name()
                );
                return Err(syn::Error::new_spanned(&arg, msg));
            };

            let Some(name) = option.path.get_ident().map(|i| i.to_string()) else {
                return Err(syn::Error::new_spanned(&option.path, OPTIONS));
            };

            let syn::Expr::Lit(syn::ExprLit { lit, .. }) = &option.value else {
                return Err(syn::Error::new_spanned(&option.value, "must be a literal"));
            };

            match name.as_str() {
                "worker_threads" => config.set_worker_threads(lit)?,
                "dispatch" => config.set_dispatch(lit)?,
                _ => {
                    let msg = format!("unknown option `{name}`, {OPTIONS}");
                    return Err(syn::Error::new_spanned(&option.path, msg));
                }
            }
        }

        Ok(config)
    }

    fn set_worker_threads(&mut self, lit: &syn::Lit) -> Result<(), syn::Error> {
        let span = lit.span();
        if self.worker_threads.is_some() {
            return Err(syn::Error::new(span, "`worker_threads` set multiple times"));
        }

        match parse_int(lit.clone(), span, "worker_threads")? {
            0 => Err(syn::Error::new(span, "`worker_threads` may not be 0")),
            n => {
                self.worker_threads = Some(n);
                Ok(())
            }
        }
    }

    fn set_dispatch(&mut self, lit: &syn::Lit) -> Result<(), syn::Error> {
        let span = lit.span();
        if self.dispatch.is_some() {
            return Err(syn::Error::new(span, "`dispatch` set multiple times"));
        }

        let variant = match parse_string(lit.clone(), span, "dispatch")?.as_str() {
            "round_robin" => quote! { RoundRobin },
            "least_loaded" => quote! { LeastLoaded },
            "shared" => quote! { Shared },
            other => {
                let msg = format!(
                    "unknown dispatch policy `{other}`, expected `round_robin`, `least_loaded` or `shared`"
                );
                return Err(syn::Error::new(span, msg));
            }
        };

        self.dispatch = Some(variant);
        Ok(())
    }
}

fn expand_fn(input: ItemFn, entry: Entry, config: Config) -> TokenStream {
    // Point type errors in the generated block at the last statement of the
    // body, using its first and last token as rustc only reports one span.
    let last_stmt = input
        .block
        .stmts
        .last()
        .map(ToTokens::to_token_stream)
        .unwrap_or_default();
    let mut tokens = last_stmt.into_iter();
    let start = tokens.next().map_or_else(Span::call_site, |t| t.span());
    let end = tokens.last().map_or(start, |t| t.span());

    let mut builder = quote_spanned! {start=> spindle::runtime::Builder::new() };
    if let Some(n) = config.worker_threads {
        builder = quote_spanned! {start=> #builder.worker_threads(#n) };
    }
    if let Some(variant) = config.dispatch {
        builder = quote_spanned! {start=>
            #builder.dispatch(spindle::runtime::Dispatch::#variant)
        };
    }

    let body = &input.block;
    let (generated_attrs, prelude) = match entry {
        Entry::Main => (quote! {}, quote! { let body = async #body; }),
        Entry::Test => {
            let output = match &input.sig.output {
                syn::ReturnType::Default => quote! { () },
                syn::ReturnType::Type(_, ty) => quote! { #ty },
            };
            // Tests share a single `block_on` instantiation over a pinned
            // trait object.
            (
                quote! { #[::core::prelude::v1::test] },
                quote! {
                    let body = ::core::pin::pin!(async #body);
                    let body: ::core::pin::Pin<&mut dyn ::core::future::Future<Output = #output>> = body;
                },
            )
        }
    };

    // `return` keeps the output type tied to the signature, see tokio-rs/tokio#4636.
    let run = quote_spanned! {end=>
        #[allow(clippy::expect_used, clippy::needless_return)]
        {
            let scheduler = #builder
                .try_build()
                .expect("Failed building the Scheduler");
            let output = scheduler.block_on(body);
            scheduler
                .shutdown()
                .expect("Failed shutting down the Scheduler");
            return output;
        }
    };

    into_tokens(input, generated_attrs, prelude, run)
}
