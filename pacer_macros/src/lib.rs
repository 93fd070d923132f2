use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemStruct};

extern crate proc_macro;

/// Turns a struct into something a probe can return.
///
/// Derives `serde::Serialize`, `Debug` and `Clone`, and implements
/// `From<Struct> for pacer::outcome::ProbeValue`. The value is published as its JSON text,
/// with a passing verdict and the measured duration.
#[proc_macro_attribute]
pub fn outcome(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let ident = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        impl #impl_generics ::std::convert::From<#ident #ty_generics> for ::pacer::outcome::ProbeValue #where_clause {
            fn from(value: #ident #ty_generics) -> Self {
                ::pacer::outcome::ProbeValue::serialized(&value)
            }
        }
    };

    TokenStream::from(expanded)
}
