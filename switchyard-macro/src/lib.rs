use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::parse::Parse;
use syn::punctuated::Punctuated;
use syn::{
    Data, DeriveInput, Fields, GenericArgument, PathArguments, Token, Type, TypePath, parenthesized,
    parse_macro_input,
};

/// Turns a struct into an injectable component and declares it for
/// `Catalog::discover()`.
///
/// Fields typed `Arc<T>` are required dependencies, `Option<Arc<T>>` are
/// optional ones, and every other field is filled with `Default::default()`.
///
/// ```rust,ignore
/// #[derive(Component)]
/// #[component(provides(dyn Greeter), controller)]
/// struct GreetingController {
///     repository: Arc<Repository>,
///     audit: Option<Arc<AuditLog>>,
///     hits: AtomicUsize,
/// }
/// ```
///
/// Recognised `#[component(...)]` options:
/// - `provides(dyn A, dyn B)` publishes the component under each interface.
/// - `controller` also declares the type's routes; it must implement `Controller`.
/// - `argument_mapper` / `return_mapper` declare the type as a user mapper.
/// - `lifecycle` skips the empty `Component` impl so hooks can be written by hand.
#[proc_macro_derive(Component, attributes(component))]
pub fn derive_component(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

#[derive(Default)]
struct Options {
    provides: Vec<Type>,
    controller: bool,
    argument_mapper: bool,
    return_mapper: bool,
    lifecycle: bool,
}

enum Injection {
    Required(Type),
    Optional(Type),
    Default,
}

fn parse_options(input: &DeriveInput) -> syn::Result<Options> {
    let mut options = Options::default();
    for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("component")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("provides") {
                let content;
                parenthesized!(content in meta.input);
                let types: Punctuated<Type, Token![,]> = content.parse_terminated(Type::parse, Token![,])?;
                options.provides.extend(types);
            } else if meta.path.is_ident("controller") {
                options.controller = true;
            } else if meta.path.is_ident("argument_mapper") {
                options.argument_mapper = true;
            } else if meta.path.is_ident("return_mapper") {
                options.return_mapper = true;
            } else if meta.path.is_ident("lifecycle") {
                options.lifecycle = true;
            } else {
                return Err(meta.error("unknown component option"));
            }
            Ok(())
        })?;
    }
    Ok(options)
}

/// Type argument of `Wrapper<T>` when the last path segment is `wrapper`.
fn unwrap_generic<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(TypePath { qself: None, path }) = ty else {
        return None;
    };
    let segment = path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let PathArguments::AngleBracketed(arguments) = &segment.arguments else {
        return None;
    };
    match arguments.args.first() {
        Some(GenericArgument::Type(inner)) if arguments.args.len() == 1 => Some(inner),
        _ => None,
    }
}

fn injection(ty: &Type) -> Injection {
    if let Some(inner) = unwrap_generic(ty, "Arc") {
        return Injection::Required(inner.clone());
    }
    if let Some(inner) = unwrap_generic(ty, "Option").and_then(|option| unwrap_generic(option, "Arc")) {
        return Injection::Optional(inner.clone());
    }
    Injection::Default
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "Component cannot be derived for generic types",
        ));
    }
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(&input, "Component can only be derived for structs"));
    };
    let options = parse_options(&input)?;
    let name = &input.ident;

    let mut declared = Vec::new();
    let mut values = Vec::new();
    for field in data.fields.iter() {
        match injection(&field.ty) {
            Injection::Required(inner) => {
                declared.push(quote! { .requires::<#inner>() });
                values.push(quote! { deps.require::<#inner>()? });
            }
            Injection::Optional(inner) => {
                declared.push(quote! { .optional::<#inner>() });
                values.push(quote! { deps.optional::<#inner>() });
            }
            Injection::Default => values.push(quote! { ::core::default::Default::default() }),
        }
    }
    let construct = match &data.fields {
        Fields::Named(fields) => {
            let names = fields.named.iter().map(|field| &field.ident);
            quote! { #name { #(#names: #values),* } }
        }
        Fields::Unnamed(_) => quote! { #name ( #(#values),* ) },
        Fields::Unit => quote! { #name },
    };

    let provides = options.provides.iter().map(|interface| {
        quote! {
            .provides::<#interface>(|component: ::std::sync::Arc<#name>| -> ::std::sync::Arc<#interface> { component })
        }
    });

    let lifecycle = if options.lifecycle {
        TokenStream2::new()
    } else {
        quote! { impl ::switchyard::component::Component for #name {} }
    };

    let mut register = quote! { catalog.register::<#name>() };
    if options.controller {
        register = quote! { #register.controller::<#name>() };
    }
    if options.argument_mapper {
        register = quote! { #register.argument_mapper::<#name>() };
    }
    if options.return_mapper {
        register = quote! { #register.return_mapper::<#name>() };
    }
    let register_fn = format_ident!("__register_{}", name.to_string().to_lowercase());

    Ok(quote! {
        #lifecycle

        impl ::switchyard::component::Injectable for #name {
            fn definition() -> ::switchyard::component::ComponentDefinition {
                ::switchyard::component::ComponentDefinition::of(
                    |deps: &::switchyard::component::Dependencies<'_>| {
                        let _ = deps;
                        ::core::result::Result::Ok(#construct)
                    },
                )
                #(#declared)*
                #(#provides)*
                .build()
            }
        }

        const _: () = {
            fn #register_fn(catalog: ::switchyard::component::Catalog) -> ::switchyard::component::Catalog {
                #register
            }

            ::switchyard::inventory::submit! {
                ::switchyard::component::Declaration::new(#register_fn)
            }
        };
    })
}
