use proc_macro::TokenStream;
use quote::{quote, quote_spanned};
use syn::{Expr, Ident, ItemFn, Visibility, parse_macro_input, spanned::Spanned};

fn is_validate_alloc(attr: &syn::Attribute) -> bool {
    attr.path
        .segments
        .last()
        .is_some_and(|seg| seg.ident == "validate_alloc")
}

/// Run the function as the first environment of a fresh kernel and check
/// its exit code.
///
/// The function must have the signature `fn(&exos::UserEnv) -> i32`. A
/// `#[validate_alloc]` below this attribute checks for leaked pages after
/// the kernel is torn down.
///
/// The kernel is built quiet, since the console flag is shared by every test
/// of the process.
#[proc_macro_attribute]
pub fn assert_exit_code(attr: TokenStream, item: TokenStream) -> TokenStream {
    let code = parse_macro_input!(attr as Expr);
    let mut input_fn = parse_macro_input!(item as ItemFn);
    let span = input_fn.span();

    let validate = input_fn.attrs.iter().any(is_validate_alloc);
    input_fn.attrs.retain(|attr| !is_validate_alloc(attr));
    let name = input_fn.sig.ident.clone();
    input_fn.sig.ident = Ident::new("__entry", name.span());
    input_fn.vis = Visibility::Inherited;

    let (track, check) = if validate {
        (
            quote! { exos::mm::track_alloc(); },
            quote! { exos::mm::validate_alloc(); },
        )
    } else {
        (quote! {}, quote! {})
    };

    TokenStream::from(quote_spanned! { span =>
        #[test]
        fn #name() {
            #input_fn
            #track
            {
                let kernel = exos::KernelBuilder::new().quiet(true).build();
                assert_eq!(kernel.boot(__entry), #code);
            }
            #check
        }
    })
}

/// Fail if a page allocated while running the function is never freed.
#[proc_macro_attribute]
pub fn validate_alloc(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut input_fn = parse_macro_input!(item as ItemFn);
    let block = *input_fn.block;
    *input_fn.block = syn::parse_quote! {
        {
            exos::mm::track_alloc();
            let _return_val = (move || { #block })();
            exos::mm::validate_alloc();
            _return_val
        }
    };
    TokenStream::from(quote_spanned! { input_fn.span() =>
        #input_fn
    })
}
