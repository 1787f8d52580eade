//! Procedural macros for the switchboard message bus.
//!
//! - `#[derive(Message)]`: implements `switchboard::Message` for a payload type,
//!   binding it to an event type and a routing domain. With `response = T` it
//!   also implements `switchboard::Exchange`, pairing the request payload with
//!   the payload its reply carries.
//!
//! Usage:
//! ```rust,ignore
//! use serde::{Deserialize, Serialize};
//! use switchboard::Message;
//!
//! #[derive(Serialize, Deserialize, Message)]
//! #[message(event = "CALL_START", domain = "call")]
//! struct CallStart { caller: String }
//!
//! #[derive(Serialize, Deserialize, Message)]
//! #[message(event = "RISK_CHECK", domain = "risk", response = RiskVerdict)]
//! struct RiskCheck { customer_id: String, amount: u64 }
//! ```
use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{DeriveInput, LitStr, Type, parse_macro_input};

#[derive(Default)]
struct MessageAttrs {
    event: Option<LitStr>,
    domain: Option<LitStr>,
    response: Option<Type>,
}

impl MessageAttrs {
    fn parse(input: &DeriveInput) -> syn::Result<Self> {
        let mut attrs = MessageAttrs::default();
        for attr in input.attrs.iter().filter(|a| a.path().is_ident("message")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("event") {
                    attrs.event = Some(meta.value()?.parse()?);
                } else if meta.path.is_ident("domain") {
                    attrs.domain = Some(meta.value()?.parse()?);
                } else if meta.path.is_ident("response") {
                    attrs.response = Some(meta.value()?.parse()?);
                } else {
                    return Err(meta.error("expected `event`, `domain` or `response`"));
                }
                Ok(())
            })?;
        }
        Ok(attrs)
    }
}

fn required(value: Option<LitStr>, key: &str, ident: &syn::Ident) -> syn::Result<LitStr> {
    let lit = value.ok_or_else(|| {
        syn::Error::new_spanned(ident, format!("missing #[message({key} = \"...\")]"))
    })?;
    if lit.value().is_empty() {
        return Err(syn::Error::new(lit.span(), format!("`{key}` must not be empty")));
    }
    Ok(lit)
}

/// Derives `switchboard::Message` (and `switchboard::Exchange` when a
/// `response` type is given).
///
/// # Attributes
///
/// - `event = "..."`: the envelope `type` this payload travels under (required)
/// - `domain = "..."`: the routing domain the type belongs to (required)
/// - `response = Type`: payload type of the reply to this request (optional)
///
/// The type must also implement `serde::Serialize` and `serde::Deserialize`.
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_message(&input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand_message(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let ident = &input.ident;
    let attrs = MessageAttrs::parse(input)?;
    let event = required(attrs.event, "event", ident)?;
    let domain = required(attrs.domain, "domain", ident)?;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            Span::call_site(),
            "#[derive(Message)] does not support generic types",
        ));
    }

    let exchange = attrs.response.map(|response| {
        quote! {
            impl switchboard::Exchange for #ident {
                type Response = #response;
            }
        }
    });

    Ok(quote! {
        impl switchboard::Message for #ident {
            const TYPE: &'static str = #event;
            const DOMAIN: &'static str = #domain;
        }
        #exchange
    })
}
