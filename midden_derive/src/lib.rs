/*
   midden, a deferred mark-and-sweep garbage collector for Rust.
   Copyright (C) 2026 The midden developers.

   This program is free software: you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation, either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! Implementation of `#[derive(Traceable)]` for `midden`.
//!
//! The generated `accept` delegates to every field in declaration order,
//! which is exactly what a hand-written implementation would do. Two helper
//! attributes adjust the traversal:
//!
//! - `#[traceable(skip)]` on a field leaves it out of the traversal (the
//!   field type then does not need to implement `Traceable`). Only use it
//!   on fields that cannot reach a deferred handle.
//! - `#[traceable(visit_with = "Type::method")]` on the type invokes the
//!   named method after the fields have been visited, for handles the
//!   field traversal cannot see. The method has the same shape as
//!   `accept`: `fn method<V: midden::Visitor>(&self, visitor: &mut V)
//!   -> Result<(), ()>`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, parse_quote, Attribute, Data, DataEnum, DeriveInput, Field, Fields, Ident,
    Index, Path,
};

/// Derive `midden::Traceable` for a struct or enum.
#[proc_macro_derive(Traceable, attributes(traceable))]
pub fn derive_traceable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Generate the whole `unsafe impl Traceable` block.
fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let hook = parse_visit_with(&input.attrs)?;

    let body = match &input.data {
        Data::Struct(data) => {
            let stmts = fields_accept(&data.fields, quote!(self.))?;
            finish(stmts, hook.as_ref())
        }
        Data::Enum(data) if data.variants.is_empty() => quote! { match *self {} },
        Data::Enum(data) => {
            let arms = enum_arms(name, data)?;
            let tail = finish(TokenStream2::new(), hook.as_ref());
            quote! {
                match self { #arms }
                #tail
            }
        }
        Data::Union(data) => {
            return Err(syn::Error::new_spanned(
                data.union_token,
                "unions cannot derive `Traceable`: the active field is unknowable",
            ))
        }
    };

    let mut generics = input.generics.clone();
    for param in generics.type_params_mut() {
        param.bounds.push(parse_quote!(::midden::Traceable));
    }
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    Ok(quote! {
        unsafe impl #impl_generics ::midden::Traceable for #name #ty_generics #where_clause {
            fn accept<V: ::midden::Visitor>(
                &self,
                visitor: &mut V,
            ) -> ::core::result::Result<(), ()> {
                #body
            }
        }
    })
}

/// Append the optional visit hook and the final `Ok(())` to a sequence of
/// field statements.
fn finish(stmts: TokenStream2, hook: Option<&Path>) -> TokenStream2 {
    let hook = hook.map(|path| quote! { #path(self, visitor)?; });
    quote! {
        #stmts
        #hook
        ::core::result::Result::Ok(())
    }
}

/// Statements accepting the visitor for every non-skipped field, accessed
/// through `receiver` (`self.` for structs, nothing for match bindings).
fn fields_accept(fields: &Fields, receiver: TokenStream2) -> syn::Result<TokenStream2> {
    let mut stmts = TokenStream2::new();
    for (index, field) in fields.iter().enumerate() {
        if is_skipped(field)? {
            continue;
        }
        let access = match &field.ident {
            Some(ident) => quote! { #receiver #ident },
            None => {
                let index = Index::from(index);
                quote! { #receiver #index }
            }
        };
        stmts.extend(quote! {
            ::midden::Traceable::accept(&#access, visitor)?;
        });
    }
    Ok(stmts)
}

/// Match arms accepting the visitor for every variant of an enum.
fn enum_arms(name: &Ident, data: &DataEnum) -> syn::Result<TokenStream2> {
    let mut arms = TokenStream2::new();
    for variant in &data.variants {
        let variant_name = &variant.ident;

        // Bind the traced fields to positional names, ignore the skipped
        // ones.
        let mut bindings = Vec::new();
        let mut stmts = TokenStream2::new();
        for (index, field) in variant.fields.iter().enumerate() {
            if is_skipped(field)? {
                continue;
            }
            let binding = format_ident!("__field{}", index);
            bindings.push((index, field, binding.clone()));
            stmts.extend(quote! {
                ::midden::Traceable::accept(#binding, visitor)?;
            });
        }

        let pattern = match &variant.fields {
            Fields::Unit => TokenStream2::new(),
            Fields::Named(_) => {
                let entries = bindings.iter().map(|(_, field, binding)| {
                    let ident = field.ident.as_ref().expect("named field has a name");
                    quote! { #ident: #binding }
                });
                quote! { { #(#entries,)* .. } }
            }
            Fields::Unnamed(fields) => {
                let mut slots = vec![quote!(_); fields.unnamed.len()];
                for (index, _, binding) in &bindings {
                    slots[*index] = quote! { #binding };
                }
                quote! { ( #(#slots),* ) }
            }
        };

        arms.extend(quote! {
            #name::#variant_name #pattern => { #stmts }
        });
    }
    Ok(arms)
}

/// Whether a field carries `#[traceable(skip)]`.
fn is_skipped(field: &Field) -> syn::Result<bool> {
    let mut skipped = false;
    for attr in &field.attrs {
        if !attr.path().is_ident("traceable") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skipped = true;
                Ok(())
            } else {
                Err(meta.error("expected `skip` on a field"))
            }
        })?;
    }
    Ok(skipped)
}

/// The path given by a type-level `#[traceable(visit_with = "...")]`, if
/// any.
fn parse_visit_with(attrs: &[Attribute]) -> syn::Result<Option<Path>> {
    let mut hook = None;
    for attr in attrs {
        if !attr.path().is_ident("traceable") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("visit_with") {
                let literal: syn::LitStr = meta.value()?.parse()?;
                hook = Some(literal.parse()?);
                Ok(())
            } else {
                Err(meta.error("expected `visit_with = \"...\"` on the type"))
            }
        })?;
    }
    Ok(hook)
}
