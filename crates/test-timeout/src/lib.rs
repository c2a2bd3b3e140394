//! Test attributes that fail a test instead of hanging it.
//!
//! `#[tokio_timeout_test]` runs an async test on its own Tokio runtime,
//! executed on a watchdog thread that panics once the deadline passes.
//! Arguments are an optional number of seconds (default 60) and an optional
//! `multi_thread` flavor:
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(10, multi_thread)]
//! async fn negotiates() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream, Parser};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

enum Arg {
    Secs(LitInt),
    Flavor(Ident),
}

impl Parse for Arg {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(Arg::Secs)
        } else {
            input.parse().map(Arg::Flavor)
        }
    }
}

struct Options {
    secs: u64,
    multi_thread: bool,
}

fn parse_options(attr: TokenStream) -> syn::Result<Options> {
    let mut options = Options {
        secs: DEFAULT_TIMEOUT_SECS,
        multi_thread: false,
    };
    let args = Punctuated::<Arg, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match arg {
            Arg::Secs(lit) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                options.secs = secs;
            }
            Arg::Flavor(ident) if ident == "multi_thread" => {
                options.multi_thread = true;
            }
            Arg::Flavor(ident) => {
                return Err(syn::Error::new_spanned(
                    &ident,
                    format!("unexpected argument `{ident}`"),
                ));
            }
        }
    }
    Ok(options)
}

/// Runs `body` on a fresh thread and waits at most `secs` for it.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {}s", #secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn has_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().collect();
    segments.len() == expected.len()
        && segments
            .iter()
            .zip(expected)
            .all(|(segment, name)| segment.ident == name)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand_async(attr, item).unwrap_or_else(|err| err.to_compile_error().into())
}

fn expand_async(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let options = parse_options(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = syn::parse(item)?;

    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        ));
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !has_path(attr, &["tokio", "test"]))
        .collect();

    let builder = if options.multi_thread {
        quote!(tokio::runtime::Builder::new_multi_thread())
    } else {
        quote!(tokio::runtime::Builder::new_current_thread())
    };
    let secs = options.secs;
    let body = watchdog(
        secs,
        quote! {{
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }},
    );

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into())
}
