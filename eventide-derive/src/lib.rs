//! Derive macros for the `Event` and `Command` traits in the `eventide` crate.
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, Ident, LitInt, LitStr, Variant, parse_macro_input};

const DEFAULT_SOURCE: &str = "urn:eventide:event";

#[derive(Default, Clone)]
struct Options {
    name: Option<String>,
    version: Option<u16>,
    source: Option<String>,
}

impl Options {
    /// Reads `#[<attribute>(...)]` and layers it over `self`.
    fn parse(&self, attrs: &[Attribute], attribute: &str) -> syn::Result<Self> {
        let mut options = self.clone();
        options.name = None;
        for attr in attrs.iter().filter(|a| a.path().is_ident(attribute)) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    options.name = Some(meta.value()?.parse::<LitStr>()?.value());
                } else if meta.path.is_ident("version") && attribute == "event" {
                    options.version = Some(meta.value()?.parse::<LitInt>()?.base10_parse()?);
                } else if meta.path.is_ident("source") && attribute == "event" {
                    options.source = Some(meta.value()?.parse::<LitStr>()?.value());
                } else {
                    return Err(meta.error(format!("unsupported {attribute} attribute")));
                }
                Ok(())
            })?;
        }
        Ok(options)
    }
}

fn variant_pattern(name: &Ident, variant: &Variant) -> TokenStream2 {
    let variant_name = &variant.ident;
    match &variant.fields {
        Fields::Named(_) => quote! { #name::#variant_name { .. } },
        Fields::Unnamed(_) => quote! { #name::#variant_name(..) },
        Fields::Unit => quote! { #name::#variant_name },
    }
}

/// Per-variant (or, for structs, per-type) options.
fn collect(input: &DeriveInput, attribute: &str) -> syn::Result<Vec<(TokenStream2, String, Options)>> {
    let name = &input.ident;
    let type_options = Options::default().parse(&input.attrs, attribute)?;
    match &input.data {
        Data::Enum(data) => data
            .variants
            .iter()
            .map(|variant| {
                let options = type_options.parse(&variant.attrs, attribute)?;
                let label = options
                    .name
                    .clone()
                    .unwrap_or_else(|| variant.ident.to_string());
                Ok((variant_pattern(name, variant), label, options))
            })
            .collect(),
        Data::Struct(_) => {
            let label = type_options.name.clone().unwrap_or_else(|| name.to_string());
            Ok(vec![(quote! { _ }, label, type_options)])
        }
        Data::Union(_) => Err(syn::Error::new_spanned(
            name,
            format!("{attribute} cannot be derived for unions"),
        )),
    }
}

/// Derives the `Event` trait for an enum or struct.
///
/// `event_type` returns the variant's name (or the struct's), unless
/// overridden with `#[event(name = "...")]`. `event_version` defaults to 1
/// and `event_source` to `urn:eventide:event`; both can be set for the whole
/// type and overridden per variant with
/// `#[event(version = N, source = "...")]`.
#[proc_macro_derive(Event, attributes(event))]
pub fn event_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let cases = match collect(&input, "event") {
        Ok(cases) => cases,
        Err(e) => return e.to_compile_error().into(),
    };
    let name = &input.ident;

    let type_arms = cases.iter().map(|(pattern, label, _)| quote! { #pattern => #label });
    let version_arms = cases.iter().map(|(pattern, _, options)| {
        let version = options.version.unwrap_or(1);
        quote! { #pattern => #version }
    });
    let source_arms = cases.iter().map(|(pattern, _, options)| {
        let source = options.source.as_deref().unwrap_or(DEFAULT_SOURCE);
        quote! { #pattern => #source }
    });

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics ::eventide::Event for #name #ty_generics #where_clause {
            fn event_type(&self) -> &'static str {
                match self {
                    #(#type_arms),*
                }
            }

            fn event_version(&self) -> u16 {
                match self {
                    #(#version_arms),*
                }
            }

            fn event_source(&self) -> &'static str {
                match self {
                    #(#source_arms),*
                }
            }
        }
    };

    TokenStream::from(expanded)
}

/// Derives the `Command` trait for an enum or struct.
///
/// `command_type` returns the variant's name (or the struct's), unless
/// overridden with `#[command(name = "...")]`.
#[proc_macro_derive(Command, attributes(command))]
pub fn command_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let cases = match collect(&input, "command") {
        Ok(cases) => cases,
        Err(e) => return e.to_compile_error().into(),
    };
    let name = &input.ident;
    let type_arms = cases.iter().map(|(pattern, label, _)| quote! { #pattern => #label });
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics ::eventide::Command for #name #ty_generics #where_clause {
            fn command_type(&self) -> &'static str {
                match self {
                    #(#type_arms),*
                }
            }
        }
    };

    TokenStream::from(expanded)
}
