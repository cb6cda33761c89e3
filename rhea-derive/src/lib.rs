use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, ReturnType,
    Type, TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive macro for the `SharedMemorySafe` trait.
///
/// Generates an implementation after verifying, at compile time, that a type
/// is fit for placement in cross-process shared memory:
///
/// 1. **Stable layout** — the type carries `#[repr(C)]`,
///    `#[repr(transparent)]`, or an integer repr for enums. The two sides of
///    a stream may be compiled separately, so the default Rust layout is not
///    acceptable.
///
/// 2. **No pointers** — virtual addresses are process-specific, so fields
///    may not contain heap handles (`Vec`, `Box`, `String`, `PathBuf`,
///    `OsString`, `CString`), reference counting (`Rc`, `Arc`), references,
///    raw pointers, or process-local synchronization (`Mutex`, `RwLock`,
///    `Condvar`, `Barrier`). Generic arguments are checked recursively, so
///    `Option<Vec<u8>>` is rejected too.
///
/// 3. **Recursive safety** — every field type is bounded by
///    `SharedMemorySafe` in the generated `where` clause.
///
/// # Safety
///
/// The generated impl is `unsafe` because two requirements cannot be checked
/// here: the type must tolerate `Drop` never running (a SIGKILL'd peer skips
/// destructors), and shared mutable state must go through atomics. Those
/// remain the implementer's responsibility.
///
/// # Example
///
/// ```
/// # use rhea::SharedMemorySafe;
/// use std::sync::atomic::AtomicUsize;
///
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct StreamState {
///     published: AtomicUsize,
///     released: AtomicUsize,
///     region: [u8; 4096],
/// }
/// ```
///
/// ```compile_fail
/// # use rhea::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct Broken {
///     records: Vec<u8>, // heap pointer: rejected
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

fn crate_path() -> proc_macro2::TokenStream {
    match crate_name("rhea") {
        Ok(FoundCrate::Itself) | Err(_) => quote!(::rhea),
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    check_repr(&input)?;

    let field_types = field_types(&input.data)?;
    field_types.iter().try_for_each(check_field_type)?;

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let path = crate_path();

    let mut predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    for ty in &field_types {
        predicates.push(syn::parse_quote! {
            #ty: #path::__SharedMemorySafePrivate
        });
    }

    let expanded = if predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #path::__SharedMemorySafePrivate for #name #ty_generics {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #path::__SharedMemorySafePrivate for #name #ty_generics
            where
                #(#predicates),*
            {}
        }
    };

    Ok(expanded.into())
}

const INT_REPRS: &[&str] = &[
    "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64", "i128", "isize",
];

fn repr_is_stable(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }

    let mut stable = false;
    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident() {
            if ident == "C" || ident == "transparent" || INT_REPRS.iter().any(|r| ident == r) {
                stable = true;
            }
        }
        Ok(())
    })?;

    Ok(stable)
}

fn check_repr(input: &DeriveInput) -> syn::Result<()> {
    for attr in &input.attrs {
        if repr_is_stable(attr)? {
            return Ok(());
        }
    }

    let help = if matches!(input.data, Data::Enum(_)) {
        "SharedMemorySafe requires #[repr(C)], #[repr(transparent)], \
         or an integer repr for enums\n\
         help: add #[repr(C)] or #[repr(u8)] above this item"
    } else {
        "SharedMemorySafe requires #[repr(C)] or #[repr(transparent)]\n\
         help: add #[repr(C)] above this item"
    };
    Err(Error::new(input.span(), help))
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
        Data::Struct(s) => Ok(of_fields(&s.fields)),
        Data::Enum(e) => Ok(e.variants.iter().flat_map(|v| of_fields(&v.fields)).collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "SharedMemorySafe cannot be derived for unions",
        )),
    }
}

/// Rejects field types that smuggle process-specific addresses, walking
/// through generic arguments, tuples, arrays, and slices.
fn check_field_type(field_ty: &Type) -> syn::Result<()> {
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    reject_forbidden(&segment.ident, field_ty)?;

                    match &segment.arguments {
                        PathArguments::AngleBracketed(args) => {
                            for arg in &args.args {
                                if let GenericArgument::Type(inner) = arg {
                                    walk(inner, field_ty)?;
                                }
                            }
                        }
                        PathArguments::Parenthesized(args) => {
                            for input in &args.inputs {
                                walk(input, field_ty)?;
                            }
                            if let ReturnType::Type(_, ret) = &args.output {
                                walk(ret, field_ty)?;
                            }
                        }
                        PathArguments::None => {}
                    }
                }
                Ok(())
            }

            Type::Reference(r) => Err(Error::new(
                r.span(),
                format!(
                    "Field type `{}` contains a reference.\n\
                     References are process-specific and cannot be shared across processes.\n\
                     help: use inline data or atomics instead",
                    quote!(#field_ty),
                ),
            )),

            Type::Ptr(p) => Err(Error::new(
                p.span(),
                format!(
                    "Field type `{}` contains a raw pointer.\n\
                     Pointers are process-specific and cannot be shared across processes.\n\
                     help: store an offset or an address as `usize` instead",
                    quote!(#field_ty),
                ),
            )),

            Type::Tuple(t) => t.elems.iter().try_for_each(|e| walk(e, field_ty)),
            Type::Array(a) => walk(&a.elem, field_ty),
            Type::Slice(s) => walk(&s.elem, field_ty),
            Type::Group(g) => walk(&g.elem, field_ty),
            Type::Paren(p) => walk(&p.elem, field_ty),

            // Remaining variants either cannot appear as struct fields or
            // carry no type arguments of interest.
            _ => Ok(()),
        }
    }

    walk(field_ty, field_ty)
}

fn reject_forbidden(ident: &Ident, field_ty: &Type) -> syn::Result<()> {
    const HEAP: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString"];
    const REF_COUNTED: &[&str] = &["Rc", "Arc"];
    const PROCESS_LOCAL: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier"];

    let complaint = if HEAP.iter().any(|&n| ident == n) {
        "owns a heap allocation; shared memory cannot contain pointer types.\n\
         help: use inline data like `[T; N]` instead"
    } else if REF_COUNTED.iter().any(|&n| ident == n) {
        "uses reference counting; shared memory cannot contain pointer types.\n\
         help: use inline data or atomics instead"
    } else if PROCESS_LOCAL.iter().any(|&n| ident == n) {
        "is process-local and does not work across process boundaries.\n\
         help: use atomic types for cross-process synchronization"
    } else {
        return Ok(());
    };

    Err(Error::new(
        ident.span(),
        format!("Field type `{}` contains `{ident}` which {complaint}", quote!(#field_ty)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn repr_c_and_transparent_accepted() {
        let c: DeriveInput = parse_quote! {
            #[repr(C)]
            struct Blocks {
                published: u64,
            }
        };
        assert!(check_repr(&c).is_ok());

        let transparent: DeriveInput = parse_quote! {
            #[repr(transparent)]
            struct Marker(u64);
        };
        assert!(check_repr(&transparent).is_ok());
    }

    #[test]
    fn int_repr_enum_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(u8)]
            enum Side {
                Writer,
                Reader,
            }
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn missing_repr_rejected() {
        let input: DeriveInput = parse_quote! {
            struct Blocks {
                published: u64,
            }
        };
        assert!(check_repr(&input).is_err());
    }

    #[test]
    fn repr_align_alone_is_not_enough() {
        let input: DeriveInput = parse_quote! {
            #[repr(align(64))]
            struct Padded {
                published: u64,
            }
        };
        assert!(check_repr(&input).is_err());
    }

    #[test]
    fn inline_data_accepted() {
        for ty in [
            parse_quote!(u32),
            parse_quote!(AtomicU64),
            parse_quote!([u8; 4096]),
            parse_quote!((u32, u64)),
            parse_quote!(Option<u32>),
        ] {
            assert!(check_field_type(&ty).is_ok(), "{}", quote!(#ty));
        }
    }

    #[test]
    fn pointer_carriers_rejected() {
        for ty in [
            parse_quote!(Vec<u8>),
            parse_quote!(Box<u32>),
            parse_quote!(String),
            parse_quote!(PathBuf),
            parse_quote!(Rc<u32>),
            parse_quote!(Arc<u32>),
            parse_quote!(&'static u32),
            parse_quote!(&mut u32),
            parse_quote!(*const u8),
            parse_quote!(*mut u8),
            parse_quote!(Mutex<u32>),
            parse_quote!(RwLock<u32>),
            parse_quote!(Condvar),
            parse_quote!(Barrier),
        ] {
            assert!(check_field_type(&ty).is_err(), "{}", quote!(#ty));
        }
    }

    #[test]
    fn nested_pointer_carriers_rejected() {
        for ty in [
            parse_quote!(Option<Vec<u8>>),
            parse_quote!(Result<Arc<u32>, u32>),
            parse_quote!((u32, Box<u64>)),
            parse_quote!([Mutex<u64>; 4]),
        ] {
            assert!(check_field_type(&ty).is_err(), "{}", quote!(#ty));
        }
    }

    #[test]
    fn field_types_collected_from_structs_and_enums() {
        let named: DeriveInput = parse_quote! {
            struct Blocks { a: u32, b: u64 }
        };
        assert_eq!(field_types(&named.data).unwrap().len(), 2);

        let tuple: DeriveInput = parse_quote! {
            struct Pair(u32, u64);
        };
        assert_eq!(field_types(&tuple.data).unwrap().len(), 2);

        let unit: DeriveInput = parse_quote! {
            struct Nothing;
        };
        assert!(field_types(&unit.data).unwrap().is_empty());

        let variants: DeriveInput = parse_quote! {
            enum Message {
                A(u32),
                B { x: u64 },
                C,
            }
        };
        assert_eq!(field_types(&variants.data).unwrap().len(), 2);
    }

    #[test]
    fn unions_rejected() {
        let input: DeriveInput = parse_quote! {
            union Raw {
                x: u32,
                y: f32,
            }
        };
        assert!(field_types(&input.data).is_err());
    }
}
