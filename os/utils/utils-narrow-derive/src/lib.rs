//! # Narrowing Derive
//!
//! This crate provides a derive macro for constraint records whose fields are
//! combined pairwise when a child record is derived from a parent record.
//!
//! Every named field is tagged with the direction in which it becomes more
//! restrictive:
//!
//! - `#[narrow(min)]`: smaller is stricter (address ceilings, size limits).
//!   The narrowed value is `min(requested, base)`.
//! - `#[narrow(max)]`: larger is stricter (alignment, address floors).
//!   The narrowed value is `max(requested, base)`.
//!
//! Field types must be `Copy + Ord`.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, parse_macro_input, spanned::Spanned};

/// Derive to generate `.narrowed_by(&self, requested: &Self) -> Self` and
/// `.is_within(&self, base: &Self) -> bool` for a struct with named fields.
///
/// - `narrowed_by` treats `self` as the base record and combines each field
///   with the corresponding field of `requested`.
/// - `is_within` holds iff no field of `self` is looser than the same field
///   of `base`.
///
/// # Example
///
/// ```
/// use utils_narrow_derive::Narrow;
///
/// #[derive(Narrow)]
/// struct Window {
///     #[narrow(max)]
///     low: u64,
///     #[narrow(min)]
///     high: u64,
/// }
///
/// let base = Window { low: 0x1000, high: 0xFFFF };
/// let req = Window { low: 0, high: 0x8000 };
/// let w = base.narrowed_by(&req);
/// assert_eq!((w.low, w.high), (0x1000, 0x8000));
/// assert!(w.is_within(&base));
/// ```
#[proc_macro_derive(Narrow, attributes(narrow))]
pub fn derive_narrow(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Narrow only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Narrow does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Narrow can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut narrowed = Vec::new();
    let mut checks = Vec::new();

    for field in &fields {
        let Some(fname) = &field.ident else { continue };
        let direction = match direction_of(&field.attrs) {
            Ok(Some(d)) => d,
            Ok(None) => {
                return syn::Error::new(
                    field.span(),
                    format!("field `{fname}` needs #[narrow(min)] or #[narrow(max)]"),
                )
                .to_compile_error()
                .into();
            }
            Err(e) => return e.to_compile_error().into(),
        };

        let combine = format_ident!("{}", direction.combinator());
        narrowed.push(quote! {
            #fname: ::core::cmp::#combine(requested.#fname, self.#fname)
        });

        checks.push(match direction {
            Direction::Min => quote! { self.#fname <= base.#fname },
            Direction::Max => quote! { self.#fname >= base.#fname },
        });
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            /// Combine this (base) record with `requested`, keeping the stricter
            /// value of every field.
            #[inline]
            #[must_use]
            pub fn narrowed_by(&self, requested: &Self) -> Self {
                Self {
                    #(#narrowed,)*
                }
            }

            /// Whether no field of this record is looser than the one in `base`.
            #[inline]
            #[must_use]
            pub fn is_within(&self, base: &Self) -> bool {
                true #(&& #checks)*
            }
        }
    };

    TokenStream::from(expanded)
}

#[derive(Copy, Clone)]
enum Direction {
    Min,
    Max,
}

impl Direction {
    const fn combinator(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

fn direction_of(attrs: &[syn::Attribute]) -> syn::Result<Option<Direction>> {
    let mut direction = None;
    for attr in attrs {
        if !attr.path().is_ident("narrow") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("min") {
                direction = Some(Direction::Min);
                Ok(())
            } else if meta.path.is_ident("max") {
                direction = Some(Direction::Max);
                Ok(())
            } else {
                Err(meta.error("expected `min` or `max`"))
            }
        })?;
    }
    Ok(direction)
}
