//! Parsing of the attribute arguments and of the annotated function.
use proc_macro2::{Delimiter, Group, Span, TokenStream, TokenTree};
use quote::ToTokens;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, Lit, Signature, Token, Visibility, braced};

const EXPECTED: &str = "expected one of: `cores`, `backend`";

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Backend {
    Epoll,
    Uring,
}

impl Backend {
    fn from_lit(lit: &Lit) -> syn::Result<Backend> {
        let Lit::Str(s) = lit else {
            return Err(syn::Error::new_spanned(lit, "`backend` must be a string literal."));
        };
        match s.value().as_str() {
            "epoll" => Ok(Backend::Epoll),
            "uring" | "io_uring" => Ok(Backend::Uring),
            other => Err(syn::Error::new_spanned(
                s,
                format!("No such reactor backend `{other}`. The backends are `epoll` and `uring`."),
            )),
        }
    }
}

enum Knob {
    Cores(Span, usize),
    Backend(Span, Backend),
}

impl Parse for Knob {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let name: Ident = input.parse()?;
        let key = name.to_string();

        if !input.peek(Token![=]) {
            let msg = match key.as_str() {
                "epoll" | "uring" | "io_uring" => {
                    format!("Select the reactor backend with `backend = \"{key}\"`.")
                }
                "cores" | "backend" => format!("The `{key}` attribute requires an argument."),
                _ => format!("Unknown attribute {key} is specified; {EXPECTED}."),
            };
            return Err(syn::Error::new(name.span(), msg));
        }
        input.parse::<Token![=]>()?;
        let value: Lit = input.parse()?;

        match key.as_str() {
            "cores" => {
                let Lit::Int(int) = &value else {
                    return Err(syn::Error::new_spanned(&value, "`cores` must be an integer literal."));
                };
                let cores = int.base10_parse::<usize>()?;
                if cores == 0 {
                    return Err(syn::Error::new_spanned(int, "`cores` may not be 0."));
                }
                Ok(Knob::Cores(name.span(), cores))
            }
            "backend" => Ok(Knob::Backend(name.span(), Backend::from_lit(&value)?)),
            _ => Err(syn::Error::new(
                name.span(),
                format!("Unknown attribute {key} is specified; {EXPECTED}."),
            )),
        }
    }
}

/// Arguments of `#[tessel::main(..)]` and `#[tessel::test(..)]`.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Knobs {
    pub(crate) cores: Option<usize>,
    pub(crate) backend: Option<Backend>,
}

impl Parse for Knobs {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut knobs = Knobs::default();
        for knob in Punctuated::<Knob, Token![,]>::parse_terminated(input)? {
            match knob {
                Knob::Cores(span, n) => {
                    if knobs.cores.replace(n).is_some() {
                        return Err(syn::Error::new(span, "`cores` set multiple times."));
                    }
                }
                Knob::Backend(span, b) => {
                    if knobs.backend.replace(b).is_some() {
                        return Err(syn::Error::new(span, "`backend` set multiple times."));
                    }
                }
            }
        }
        Ok(knobs)
    }
}

/// `#[test]`, or the prelude paths it resolves to.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };
    if path.segments.iter().any(|s| !s.arguments.is_none()) {
        return false;
    }
    let segments: Vec<String> = path.segments.iter().map(|s| s.ident.to_string()).collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    match segments.as_slice() {
        ["test"] => path.leading_colon.is_none(),
        ["core" | "std", "prelude", _, "test"] => true,
        _ => false,
    }
}

pub(crate) fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}

/// An async function whose body is kept as raw tokens. Type errors in the
/// body then surface against the user's code rather than a half-parsed
/// expansion.
pub(crate) struct EntryFn {
    outer_attrs: Vec<Attribute>,
    inner_attrs: Vec<Attribute>,
    vis: Visibility,
    pub(crate) sig: Signature,
    brace_token: syn::token::Brace,
    stmts: TokenStream,
}

impl EntryFn {
    pub(crate) fn attrs(&self) -> impl Iterator<Item = &Attribute> {
        self.outer_attrs.iter().chain(self.inner_attrs.iter())
    }

    /// The body as a block, with its original braces.
    pub(crate) fn body(&self) -> TokenStream {
        let mut group = Group::new(Delimiter::Brace, self.stmts.clone());
        group.set_span(self.brace_token.span.join());
        TokenTree::Group(group).into()
    }

    /// First and last span of the final statement, where rustc reports a
    /// mismatch with the return type.
    pub(crate) fn last_stmt_spans(&self) -> (Span, Span) {
        let mut last = Vec::new();
        let mut current = Vec::new();
        for tt in self.stmts.clone() {
            let ends_stmt = matches!(&tt, TokenTree::Punct(p) if p.as_char() == ';');
            current.push(tt);
            if ends_stmt {
                last = std::mem::take(&mut current);
            }
        }
        if !current.is_empty() {
            last = current;
        }

        let start = last.first().map_or_else(Span::call_site, TokenTree::span);
        let end = last.last().map_or(start, TokenTree::span);
        (start, end)
    }

    /// Re-emits the function as a sync one running `body` then `tail`.
    /// Inner attributes are lifted outside, since blocks do not take them.
    pub(crate) fn into_tokens(
        self,
        generated_attrs: TokenStream,
        body: TokenStream,
        tail: TokenStream,
    ) -> TokenStream {
        let mut tokens = TokenStream::new();
        for attr in self.outer_attrs {
            attr.to_tokens(&mut tokens);
        }
        for mut attr in self.inner_attrs {
            attr.style = syn::AttrStyle::Outer;
            attr.to_tokens(&mut tokens);
        }
        generated_attrs.to_tokens(&mut tokens);

        self.vis.to_tokens(&mut tokens);
        self.sig.to_tokens(&mut tokens);
        self.brace_token.surround(&mut tokens, |tokens| {
            body.to_tokens(tokens);
            tail.to_tokens(tokens);
        });
        tokens
    }
}

impl Parse for EntryFn {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let outer_attrs = input.call(Attribute::parse_outer)?;
        let vis: Visibility = input.parse()?;
        let sig: Signature = input.parse()?;

        let content;
        let brace_token = braced!(content in input);
        let inner_attrs = Attribute::parse_inner(&content)?;
        let stmts: TokenStream = content.parse()?;

        Ok(EntryFn {
            outer_attrs,
            inner_attrs,
            vis,
            sig,
            brace_token,
            stmts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::quote;

    fn knobs(tokens: TokenStream) -> syn::Result<Knobs> {
        syn::parse2(tokens)
    }

    fn error(tokens: TokenStream) -> String {
        match knobs(tokens) {
            Ok(k) => panic!("expected an error, parsed {k:?}"),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn test_knobs() {
        assert_eq!(knobs(quote!()).unwrap(), Knobs::default());
        assert_eq!(
            knobs(quote!(cores = 4, backend = "uring",)).unwrap(),
            Knobs {
                cores: Some(4),
                backend: Some(Backend::Uring),
            }
        );
        assert_eq!(
            knobs(quote!(backend = "epoll")).unwrap().backend,
            Some(Backend::Epoll)
        );
    }

    #[test]
    fn test_knob_errors() {
        assert!(error(quote!(cores = 0)).contains("may not be 0"));
        assert!(error(quote!(cores = "2")).contains("integer literal"));
        assert!(error(quote!(cores = 1, cores = 2)).contains("set multiple times"));
        assert!(error(quote!(backend = "kqueue")).contains("No such reactor backend"));
        assert!(error(quote!(uring)).contains("backend = \"uring\""));
        assert!(error(quote!(cores)).contains("requires an argument"));
        assert!(error(quote!(flavor = "local")).contains(EXPECTED));
    }

    #[test]
    fn test_is_test_attribute() {
        let attrs: Vec<Attribute> = vec![
            syn::parse_quote!(#[test]),
            syn::parse_quote!(#[::core::prelude::v1::test]),
            syn::parse_quote!(#[std::prelude::rust_2024::test]),
            syn::parse_quote!(#[::test]),
            syn::parse_quote!(#[tessel::test]),
            syn::parse_quote!(#[test(cores = 2)]),
        ];
        let found: Vec<bool> = attrs.iter().map(is_test_attribute).collect();
        assert_eq!(found, vec![true, true, true, false, false, false]);
    }

    #[test]
    fn test_entry_fn_keeps_body_and_lifts_inner_attrs() {
        let f: EntryFn = syn::parse2(quote! {
            #[allow(unused)]
            async fn check() -> u32 {
                #![allow(dead_code)]
                let x = 1;
                x + 1
            }
        })
        .unwrap();
        assert_eq!(f.attrs().count(), 2);
        assert_eq!(f.sig.ident, "check");
        assert!(f.sig.asyncness.is_some());

        let compact = |ts: TokenStream| ts.to_string().replace(' ', "");
        let body = compact(f.body());
        assert!(body.starts_with('{'));
        assert!(body.contains("letx=1;"));
        assert!(!body.contains("dead_code"));

        let out = compact(f.into_tokens(quote!(), quote!(), quote!()));
        assert!(out.starts_with("#[allow(unused)]#[allow(dead_code)]asyncfncheck"), "{out}");
    }
}
