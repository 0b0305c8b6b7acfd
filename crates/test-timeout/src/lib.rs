//! Test attributes that bound every test by a wall-clock timeout.
//!
//! `#[tokio_timeout_test]` runs an async test on a fresh current-thread runtime,
//! `#[timeout]` wraps a synchronous test. Both accept an optional number of
//! seconds (default 60). The async form also accepts `paused`, which starts the
//! runtime with the tokio clock paused so timers auto-advance:
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(30, paused)]
//! async fn meters_three_minutes() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TestOptions {
    timeout_secs: u64,
    paused: bool,
}

fn parse_options(attr: TokenStream, allow_paused: bool) -> syn::Result<TestOptions> {
    let mut options = TestOptions {
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(expr) => match &expr.lit {
                Lit::Int(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    options.timeout_secs = secs;
                }
                other => {
                    return Err(syn::Error::new_spanned(other, "expected timeout in seconds"));
                }
            },
            Expr::Path(path) if allow_paused && path.path.is_ident("paused") => {
                options.paused = true;
            }
            other => {
                let expected = if allow_paused {
                    "expected timeout seconds or `paused`"
                } else {
                    "expected timeout seconds"
                };
                return Err(syn::Error::new_spanned(other, expected));
            }
        }
    }
    Ok(options)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;
    // A paused clock auto-advances whenever the runtime idles, so an inner tokio
    // timeout would fire spuriously; the outer wall-clock guard still applies.
    let (builder_tail, body) = if options.paused {
        (
            quote! { .start_paused(true) },
            quote! { runtime.block_on(async move #block); },
        )
    } else {
        (
            quote! {},
            quote! {
                runtime.block_on(async {
                    tokio::time::timeout(timeout_duration, async move #block)
                        .await
                        .expect("test timed out");
                });
            },
        )
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        #builder_tail
                        .build()
                        .expect("failed to build Tokio runtime");
                    #body
                }));
                let _ = sender.send(result);
            });
            wait_for_test(receiver, timeout_duration);

            fn wait_for_test(
                receiver: std::sync::mpsc::Receiver<std::thread::Result<()>>,
                timeout_duration: std::time::Duration,
            ) {
                match receiver.recv_timeout(timeout_duration) {
                    Ok(Ok(_)) => {}
                    Ok(Err(payload)) => std::panic::resume_unwind(payload),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        panic!("test thread failed before reporting result")
                    }
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block ));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
