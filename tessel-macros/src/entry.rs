//! Expansion of the `main` and `test` attributes.
use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};

use crate::parse::{Backend, EntryFn, Knobs, is_test_attribute, token_stream_with_error};

/// Expands as if no arguments were given, when they fail to parse.
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    cores: None,
    backend: None,
};

/// The attribute arguments and the annotated function arrive separately:
///
/// ```rust,no_run
/// #[tessel::main(cores = 2, backend = "epoll")]
/// async fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Here `args` is `cores = 2, backend = "epoll"` and `item` is the async
/// function whose body becomes the root future of the runtime.
pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    // A failed step still expands to something close to the expected item,
    // so IDE completions keep working.
    let input: EntryFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        let msg = "the main function cannot accept arguments";
        Err(syn::Error::new_spanned(&input.sig.ident, msg))
    } else {
        build_config(&input, args, false)
    };

    match config {
        Ok(config) => parse_knobs(input, false, config),
        Err(e) => token_stream_with_error(parse_knobs(input, false, DEFAULT_ERROR_CONFIG), e),
    }
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: EntryFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };
    let config = if let Some(attr) = input.attrs().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        build_config(&input, args, true)
    };

    match config {
        Ok(config) => parse_knobs(input, true, config),
        Err(e) => token_stream_with_error(parse_knobs(input, true, DEFAULT_ERROR_CONFIG), e),
    }
}

struct FinalConfig {
    cores: Option<usize>,
    backend: Option<Backend>,
}

fn build_config(input: &EntryFn, args: TokenStream, is_test: bool) -> Result<FinalConfig, syn::Error> {
    if input.sig.asyncness.is_none() {
        let msg = "the `async` keyword is missing from the function declaration";
        return Err(syn::Error::new_spanned(input.sig.fn_token, msg));
    }
    let knobs: Knobs = syn::parse2(args)?;

    // Tests get a single core unless asked otherwise, applications get the
    // builder default of one core per allowed cpu.
    let cores = match (knobs.cores, is_test) {
        (Some(cores), _) => Some(cores),
        (None, true) => Some(1),
        (None, false) => None,
    };

    Ok(FinalConfig {
        cores,
        backend: knobs.backend,
    })
}

fn parse_knobs(mut input: EntryFn, is_test: bool, config: FinalConfig) -> TokenStream {
    input.sig.asyncness = None;

    // A type mismatch is reported against the last statement.
    let (last_stmt_start_span, last_stmt_end_span) = input.last_stmt_spans();

    let mut rt = quote_spanned! {last_stmt_start_span=>
        tessel::runtime::Builder::new()
    };

    if let Some(v) = config.cores {
        rt = quote_spanned! {last_stmt_start_span=> #rt.cores(#v) };
    }

    match config.backend {
        Some(Backend::Epoll) => {
            rt = quote_spanned! {last_stmt_start_span=>
                #rt.backend(tessel::runtime::BackendKind::Epoll)
            };
        }
        Some(Backend::Uring) => {
            rt = quote_spanned! {last_stmt_start_span=>
                #rt.backend(tessel::runtime::BackendKind::Uring)
            };
        }
        None => {}
    }

    let generated_attrs = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let body_ident = quote! { body };
    // This explicit `return` is intentional. See tokio-rs/tokio#4636
    let last_block = quote_spanned! {last_stmt_end_span=>
        #[allow(clippy::expect_used, clippy::diverging_sub_expression, clippy::needless_return, clippy::unwrap_in_result)]
        {
            return #rt
                .try_build()
                .expect("Failed building the Runtime")
                .block_on(#body_ident);
        }
    };

    let body = input.body();

    // For test functions pin the body to the stack and use `Pin<&mut dyn
    // Future>` to reduce the amount of `Runtime::block_on` (and related
    // functions) copies we generate during compilation due to the generic
    // parameter `F` (the future to block on). This could have an impact on
    // performance, but because it's only for testing it's unlikely to be very
    // large.
    //
    // We don't do this for the main function as it should only be used once so
    // there will be no benefit.

    let body = if is_test {
        let output_type = match &input.sig.output {
            // For functions with no return value syn doesn't print anything,
            // but that doesn't work as `Output` for our boxed `Future`, so
            // default to `()` (the same type as the function output).
            syn::ReturnType::Default => quote! { () },
            syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
        };
        quote! {
            let mut unpinned = async #body;
            let pinned = std::pin::pin!(unpinned);
            let body: ::core::pin::Pin<&mut dyn ::core::future::Future<Output = #output_type>> = pinned;
        }
    } else {
        quote! {
            let body = async #body;
        }
    };

    input.into_tokens(generated_attrs, body, last_block)
}
