use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, ReturnType,
    Type, TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive macro for the `SharedMemorySafe` trait.
///
/// Validates at compile time that a type can be placed in POSIX shared
/// memory and accessed from several processes at once:
///
/// 1. **Stable layout**: the type carries `#[repr(C)]`, `#[repr(transparent)]`
///    or, for enums, a primitive repr such as `#[repr(u8)]`. Rust's default
///    layout may differ between separately compiled participants.
/// 2. **No pointer-carrying fields**: field types are walked recursively
///    (through generic arguments, tuples, arrays and `Fn` sugar) against a
///    deny-list of pointer carriers: owning heap containers, `Rc`/`Arc`,
///    process-local sync primitives, plus any reference or raw pointer. An
///    address only means something inside the process that produced it.
/// 3. **Recursive safety**: every field type gets a `SharedMemorySafe`
///    where-clause bound, so the requirement propagates.
///
/// What the macro cannot check remains the implementer's responsibility:
/// shared mutation must go through atomics, and the type must stay sound if
/// `Drop` never runs (a crashed process skips destructors).
///
/// # Example
///
/// ```
/// use sluice::SharedMemorySafe;
/// use std::sync::atomic::AtomicU64;
///
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct RingHeader {
///     write_seq: AtomicU64,
///     read_seq: AtomicU64,
///     slots: [u8; 4096],
/// }
/// ```
///
/// # Compile errors
///
/// ```compile_fail
/// # use sluice::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// struct MissingRepr { // Error: requires #[repr(C)]
///     x: u32,
/// }
/// ```
///
/// ```compile_fail
/// # use sluice::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct HasPointer {
///     data: Vec<u8>, // Error: Vec is heap-allocated
/// }
/// ```
#[proc_macro_derive(SharedMemorySafe)]
pub fn derive_shared_memory_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    check_repr(&input)?;

    let field_types = field_types(&input.data)?;
    for ty in &field_types {
        scan_for_pointer_carriers(ty)?;
    }

    let name = &input.ident;
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let crate_path = resolve_crate_path();

    let mut predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    for ty in &field_types {
        predicates.push(syn::parse_quote! {
            #ty: #crate_path::__SharedMemorySafePrivate
        });
    }

    let expanded = if predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #crate_path::__SharedMemorySafePrivate for #name #ty_generics #where_clause {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #crate_path::__SharedMemorySafePrivate for #name #ty_generics
            where
                #(#predicates),*
            {}
        }
    };

    Ok(expanded.into())
}

/// Resolves `::sluice` regardless of how the dependent crate renamed it.
fn resolve_crate_path() -> proc_macro2::TokenStream {
    match crate_name("sluice") {
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        Ok(FoundCrate::Itself) | Err(_) => quote!(::sluice),
    }
}

const PRIMITIVE_REPRS: &[&str] = &[
    "C", "transparent", "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64",
    "i128", "isize",
];

fn attr_has_valid_repr(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }

    let mut valid = false;
    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident()
            && PRIMITIVE_REPRS.iter().any(|r| ident == r)
        {
            valid = true;
        }
        Ok(())
    })?;

    Ok(valid)
}

fn check_repr(input: &DeriveInput) -> syn::Result<()> {
    for attr in &input.attrs {
        if attr_has_valid_repr(attr)? {
            return Ok(());
        }
    }

    let accepted = if matches!(input.data, Data::Enum(_)) {
        "#[repr(C)] or a primitive repr like #[repr(u8)]"
    } else {
        "#[repr(C)] or #[repr(transparent)]"
    };
    Err(Error::new(
        input.span(),
        format!(
            "this type has no stable layout, so separately compiled processes \
             could disagree on its field offsets; annotate it with {accepted} \
             to derive SharedMemorySafe"
        ),
    ))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn of_fields(fields: &Fields) -> Vec<Type> {
        match fields {
            Fields::Named(fields) => fields.named.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unnamed(fields) => fields.unnamed.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unit => Vec::new(),
        }
    }

    match data {
        Data::Struct(data) => Ok(of_fields(&data.fields)),
        Data::Enum(data) => Ok(data
            .variants
            .iter()
            .flat_map(|variant| of_fields(&variant.fields))
            .collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "SharedMemorySafe cannot be derived for unions",
        )),
    }
}

/// Deny-list of type names that smuggle a process-local pointer into an
/// otherwise plain struct, each paired with the reason the diagnostic gives.
const POINTER_CARRIERS: &[(&str, &str)] = &[
    ("Vec", "owns a heap allocation"),
    ("Box", "owns a heap allocation"),
    ("String", "owns a heap allocation"),
    ("PathBuf", "owns a heap allocation"),
    ("OsString", "owns a heap allocation"),
    ("CString", "owns a heap allocation"),
    ("Rc", "is a reference-counted pointer"),
    ("Arc", "is a reference-counted pointer"),
    ("Mutex", "only synchronizes threads of one process"),
    ("RwLock", "only synchronizes threads of one process"),
    ("Condvar", "only synchronizes threads of one process"),
    ("Barrier", "only synchronizes threads of one process"),
];

/// Walks a field type, including every nested position a type can hide in,
/// and rejects pointer carriers.
fn scan_for_pointer_carriers(field_ty: &Type) -> syn::Result<()> {
    scan(field_ty, field_ty)
}

fn scan(ty: &Type, field_ty: &Type) -> syn::Result<()> {
    match ty {
        Type::Path(TypePath { qself, path }) => {
            if let Some(qself) = qself {
                scan(&qself.ty, field_ty)?;
            }
            for segment in &path.segments {
                deny_known_carrier(&segment.ident, field_ty)?;
                match &segment.arguments {
                    PathArguments::None => {}
                    PathArguments::AngleBracketed(args) => {
                        for arg in &args.args {
                            if let GenericArgument::Type(inner) = arg {
                                scan(inner, field_ty)?;
                            }
                        }
                    }
                    PathArguments::Parenthesized(args) => {
                        for input in &args.inputs {
                            scan(input, field_ty)?;
                        }
                        if let ReturnType::Type(_, ret) = &args.output {
                            scan(ret, field_ty)?;
                        }
                    }
                }
            }
            Ok(())
        }

        Type::Reference(_) | Type::Ptr(_) => Err(Error::new(
            ty.span(),
            format!(
                "`{}` embeds a borrow or raw pointer, and an address is only \
                 valid in the process that produced it; store the data inline \
                 and coordinate through atomics",
                quote!(#field_ty),
            ),
        )),

        Type::Tuple(tuple) => tuple.elems.iter().try_for_each(|elem| scan(elem, field_ty)),
        Type::Array(array) => scan(&array.elem, field_ty),
        Type::Slice(slice) => scan(&slice.elem, field_ty),
        Type::Group(group) => scan(&group.elem, field_ty),
        Type::Paren(paren) => scan(&paren.elem, field_ty),

        // Remaining variants either cannot appear as struct fields or carry
        // no nested types worth scanning.
        _ => Ok(()),
    }
}

fn deny_known_carrier(ident: &Ident, field_ty: &Type) -> syn::Result<()> {
    let Some((_, why)) = POINTER_CARRIERS.iter().find(|(name, _)| ident == name) else {
        return Ok(());
    };
    Err(Error::new(
        ident.span(),
        format!(
            "`{ident}` {why} and cannot cross a process boundary, so `{}` is \
             not shared-memory safe; keep the payload inline ([T; N], \
             primitives) and use atomics for shared state",
            quote!(#field_ty),
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn repr_c_and_transparent_are_accepted() {
        let c: DeriveInput = parse_quote! {
            #[repr(C)]
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&c).is_ok());

        let transparent: DeriveInput = parse_quote! {
            #[repr(transparent)]
            struct Bar(u32);
        };
        assert!(check_repr(&transparent).is_ok());

        let primitive_enum: DeriveInput = parse_quote! {
            #[repr(u8)]
            enum Kind {
                A,
                B,
            }
        };
        assert!(check_repr(&primitive_enum).is_ok());
    }

    #[test]
    fn missing_repr_is_rejected() {
        let input: DeriveInput = parse_quote! {
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_err());
    }

    #[test]
    fn align_alone_is_not_enough() {
        let input: DeriveInput = parse_quote! {
            #[repr(align(64))]
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_err());
    }

    #[test]
    fn plain_and_atomic_fields_pass() {
        for ty in [
            parse_quote!(u32),
            parse_quote!(AtomicU64),
            parse_quote!([u8; 64]),
            parse_quote!(Option<u32>),
            parse_quote!(Result<u32, i32>),
        ] {
            assert!(scan_for_pointer_carriers(&ty).is_ok(), "{}", quote!(#ty));
        }
    }

    #[test]
    fn pointer_carrying_fields_fail() {
        for ty in [
            parse_quote!(Vec<u8>),
            parse_quote!(Box<u32>),
            parse_quote!(String),
            parse_quote!(PathBuf),
            parse_quote!(Rc<u32>),
            parse_quote!(Arc<u32>),
            parse_quote!(&u32),
            parse_quote!(&mut u32),
            parse_quote!(*const u32),
            parse_quote!(*mut u32),
            parse_quote!(Mutex<u32>),
            parse_quote!(RwLock<u32>),
            parse_quote!(Condvar),
            parse_quote!(Barrier),
        ] {
            assert!(scan_for_pointer_carriers(&ty).is_err(), "{}", quote!(#ty));
        }
    }

    #[test]
    fn nested_pointers_are_found() {
        for ty in [
            parse_quote!(Option<Vec<u8>>),
            parse_quote!(Result<Arc<u32>, String>),
            parse_quote!((u32, Box<u64>)),
            parse_quote!([Mutex<u64>; 4]),
        ] {
            assert!(scan_for_pointer_carriers(&ty).is_err(), "{}", quote!(#ty));
        }
    }

    #[test]
    fn field_types_cover_structs_and_enums() {
        let named: DeriveInput = parse_quote! {
            struct Foo {
                x: u32,
                y: u64,
            }
        };
        assert_eq!(field_types(&named.data).unwrap().len(), 2);

        let tuple: DeriveInput = parse_quote! {
            struct Bar(u32, u64);
        };
        assert_eq!(field_types(&tuple.data).unwrap().len(), 2);

        let unit: DeriveInput = parse_quote! {
            struct Baz;
        };
        assert!(field_types(&unit.data).unwrap().is_empty());

        let with_variants: DeriveInput = parse_quote! {
            enum Kind {
                A(u32),
                B { x: u64 },
                C,
            }
        };
        assert_eq!(field_types(&with_variants.data).unwrap().len(), 2);
    }

    #[test]
    fn unions_are_rejected() {
        let input: DeriveInput = parse_quote! {
            union Both {
                x: u32,
                y: f32,
            }
        };
        assert!(field_types(&input.data).is_err());
    }
}
