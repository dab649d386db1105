use proc_macro2::{Span, TokenStream};
use quote::{ToTokens, quote};
use syn::{Attribute, ItemFn};

pub(crate) fn parse_string(lit: syn::Lit, span: Span, field: &str) -> Result<String, syn::Error> {
    match lit {
        syn::Lit::Str(s) => Ok(s.value()),
        _ => Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as string."),
        )),
    }
}

pub(crate) fn parse_int(lit: syn::Lit, span: Span, field: &str) -> Result<usize, syn::Error> {
    let syn::Lit::Int(lit) = lit else {
        return Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as integer."),
        ));
    };

    lit.base10_parse::<usize>().map_err(|e| {
        syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as integer: {e}"),
        )
    })
}

/// Matches `#[test]`, `#[core::prelude::*::test]` and `#[std::prelude::*::test]`.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };

    if path.leading_colon.is_none() && path.is_ident("test") {
        return true;
    }

    let segments = path
        .segments
        .iter()
        .map(|s| s.arguments.is_none().then(|| s.ident.to_string()))
        .collect::<Option<Vec<_>>>();

    match segments.as_deref() {
        Some([root, prelude, _edition, test]) => {
            (root == "core" || root == "std") && prelude == "prelude" && test == "test"
        }
        _ => false,
    }
}

pub(crate) fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}

/// Rebuilds `input` as a synchronous function: its attributes, `generated_attrs`
/// after them, then a body made of `prelude` followed by `last_block`.
pub(crate) fn into_tokens(
    mut input: ItemFn,
    generated_attrs: TokenStream,
    prelude: TokenStream,
    last_block: TokenStream,
) -> TokenStream {
    input.sig.asyncness = None;

    // Inner attributes are not allowed on the block we expand into, lift them
    // outside of the function.
    for attr in &mut input.attrs {
        attr.style = syn::AttrStyle::Outer;
    }

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;

    let mut tokens = quote! {
        #(#attrs)*
        #generated_attrs
        #vis #sig
    };

    input.block.brace_token.surround(&mut tokens, |tokens| {
        prelude.to_tokens(tokens);
        last_block.to_tokens(tokens);
    });

    tokens
}
