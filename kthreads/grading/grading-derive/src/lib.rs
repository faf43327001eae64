use proc_macro::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{FnArg, ItemFn, LitStr, Pat, parse_macro_input, spanned::Spanned};

/// Registers a test case as a `cargo test` test.
///
/// The function is kept as is, so it can still be handed to the
/// `TestDriver`. A test module of the same name boots a fresh kernel and
/// runs the case in its own kernel thread.
#[proc_macro_attribute]
pub fn ktest(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = parse_macro_input!(item as ItemFn);
    let name = &input_fn.sig.ident;
    let test_mod = format_ident!("{}", name);
    TokenStream::from(quote_spanned! { input_fn.span() =>
        #input_fn

        #[cfg(test)]
        mod #test_mod {
            #[test]
            fn ktest() {
                grading::run_isolated(&super::#name);
            }
        }
    })
}

/// Asserts that the body of a test case faults with a message containing
/// the given text.
///
/// The body runs in a fresh kernel thread which the case joins.
#[proc_macro_attribute]
pub fn assert_fault(attr: TokenStream, item: TokenStream) -> TokenStream {
    let message = parse_macro_input!(attr as LitStr);
    let mut input_fn = parse_macro_input!(item as ItemFn);
    let kernel = match input_fn.sig.inputs.first() {
        Some(FnArg::Typed(arg)) => match &*arg.pat {
            Pat::Ident(ident) => ident.ident.clone(),
            _ => {
                return syn::Error::new(arg.span(), "expected `kernel: &Kernel`")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(input_fn.sig.span(), "expected `kernel: &Kernel`")
                .to_compile_error()
                .into();
        }
    };
    let name = input_fn.sig.ident.to_string();
    let block = input_fn.block.clone();
    *input_fn.block = syn::parse_quote! {
        {
            let __kernel = #kernel.clone();
            let __result = kthreads::thread::ThreadBuilder::new(#kernel, #name)
                .spawn(move || {
                    let #kernel = &__kernel;
                    #block
                })
                .join();
            match __result {
                Err(fault) => assert!(
                    fault.contains(#message),
                    "expected a fault containing {:?}, got {:?}",
                    #message,
                    fault
                ),
                Ok(()) => panic!("expected a fault containing {:?}", #message),
            }
        }
    };
    TokenStream::from(quote! {
        #input_fn
    })
}
