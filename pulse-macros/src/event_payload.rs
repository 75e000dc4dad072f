use crate::utils::{EventAttr, parse_event_attrs};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Expr, Fields, LitStr, Result, spanned::Spanned};

pub(crate) fn expand(input: DeriveInput) -> Result<TokenStream> {
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let top = parse_event_attrs(&input.attrs)?;

    let (type_body, priority_body) = match &input.data {
        Data::Struct(_) => {
            let lit = top
                .event_type
                .unwrap_or_else(|| LitStr::new(&ident.to_string(), ident.span()));
            (quote! { #lit }, priority_tokens(top.priority.as_ref()))
        }
        Data::Enum(data) => {
            if let Some(lit) = &top.event_type {
                return Err(syn::Error::new(
                    lit.span(),
                    "'event_type' is per variant on enums; put #[event(event_type = ...)] on each variant",
                ));
            }

            let enum_name = ident.to_string();
            let mut type_arms = Vec::new();
            let mut priority_arms = Vec::new();

            for v in &data.variants {
                let EventAttr {
                    event_type,
                    priority,
                } = parse_event_attrs(&v.attrs)?;
                let v_ident = &v.ident;
                let pattern = match &v.fields {
                    Fields::Named(_) => quote! { Self::#v_ident { .. } },
                    Fields::Unnamed(_) => quote! { Self::#v_ident(..) },
                    Fields::Unit => quote! { Self::#v_ident },
                };

                // 变体级覆盖或默认：EnumName.Variant
                let lit = event_type.unwrap_or_else(|| {
                    LitStr::new(&format!("{}.{}", enum_name, v_ident), v_ident.span())
                });
                let prio = priority_tokens(priority.as_ref().or(top.priority.as_ref()));

                type_arms.push(quote! { #pattern => #lit });
                priority_arms.push(quote! { #pattern => #prio });
            }

            if data.variants.is_empty() {
                (quote! { match *self {} }, quote! { match *self {} })
            } else {
                (
                    quote! { match self { #(#type_arms,)* } },
                    quote! { match self { #(#priority_arms,)* } },
                )
            }
        }
        Data::Union(u) => {
            return Err(syn::Error::new(
                u.union_token.span(),
                "#[derive(EventPayload)] supports structs and enums only",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics ::pulse_core::event::EventPayload for #ident #ty_generics #where_clause {
            fn event_type(&self) -> &'static str {
                #type_body
            }

            fn priority(&self) -> ::std::option::Option<i32> {
                #priority_body
            }
        }
    })
}

fn priority_tokens(priority: Option<&Expr>) -> TokenStream {
    match priority {
        Some(expr) => quote! { ::std::option::Option::Some(#expr) },
        None => quote! { ::std::option::Option::None },
    }
}
