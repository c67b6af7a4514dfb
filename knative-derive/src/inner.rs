use crate::{
    REQUIRED_VARIANTS,
    error::VerificationError
};
use proc_macro::TokenStream;
use quote::quote;
use syn::{
    spanned::Spanned,
    punctuated::Punctuated,
    token::Comma,
    Variant,
    Result,
    Data::Enum,
    DeriveInput,
    Ident,
    Meta,
    NestedMeta,
};

#[derive(Clone, Copy, PartialEq)]
enum Dependency {
    Independent,
    Error,
    Warning,
}

/// How a variant takes part in the happy condition, from its `#[dependent]` attribute.
fn dependency(variant: &Variant) -> Result<Dependency> {
    let mut dependency = Dependency::Independent;

    for attr in variant.attrs.iter().filter(|a| a.path.is_ident("dependent")) {
        dependency = match attr.parse_meta()? {
            Meta::Path(_) => Dependency::Error,
            Meta::List(list) => {
                let mut found = Dependency::Error;
                for nested in list.nested.iter() {
                    match nested {
                        NestedMeta::Meta(Meta::Path(p)) if p.is_ident("warning") => {
                            found = Dependency::Warning
                        }
                        other => {
                            return Err(VerificationError::UnknownDependentOption(quote!(#other).to_string())
                                .at(other.span()))
                        }
                    }
                }
                found
            }
            Meta::NameValue(nv) => {
                return Err(VerificationError::UnknownDependentOption(quote!(#nv).to_string())
                    .at(nv.span()))
            }
        };
    }

    Ok(dependency)
}

fn is_happy(variant: &Variant) -> bool {
    REQUIRED_VARIANTS.contains(&variant.ident.to_string().as_str())
}

/// Returns the single happy variant once every variant checks out.
fn verify_variants(variants: &Punctuated<Variant, Comma>) -> Result<&Variant> {
    let mut happy: Option<&Variant> = None;

    for v in variants {
        if !matches!(v.fields, syn::Fields::Unit) {
            return Err(VerificationError::UnitVariantsOnly(v.ident.to_string()).at(v.fields.span()));
        }
        if !is_happy(v) {
            continue;
        }
        if dependency(v)? != Dependency::Independent {
            return Err(VerificationError::NotDependent(v.ident.to_string()).at(v.span()));
        }
        if happy.replace(v).is_some() {
            return Err(VerificationError::OneRequiredVariant.at(v.span()));
        }
    }

    happy.ok_or_else(|| VerificationError::OneRequiredVariant.into())
}

pub fn inner_derive(ast: DeriveInput) -> Result<TokenStream> {
    let name = &ast.ident;

    let variants = match ast.data {
        Enum(syn::DataEnum { ref variants, .. }) => variants,
        _ => return Err(VerificationError::NotAnEnum.at(ast.span())),
    };

    let happy = &verify_variants(variants)?.ident;

    let mut dependents = Vec::new();
    let mut errors = vec![happy];
    let mut warnings = Vec::new();
    for v in variants.iter() {
        match dependency(v)? {
            Dependency::Error => {
                dependents.push(&v.ident);
                errors.push(&v.ident);
            }
            Dependency::Warning => {
                dependents.push(&v.ident);
                warnings.push(&v.ident);
            }
            Dependency::Independent => {}
        }
    }

    let capitalized = variants.iter()
        .map(|v| v.ident.clone())
        .filter(|v| !REQUIRED_VARIANTS.contains(&v.to_string().as_str()));
    let lower_case = capitalized.clone()
        .map(|v| Ident::new(&v.to_string().to_lowercase(), v.span()));
    let lower_case_doc = capitalized.clone()
        .map(|c| format!("Returns the `{c}` variant of the [`ConditionType`]"));
    let lower_case_again = lower_case.clone();
    let lower_case_again_again = lower_case.clone();

    let mark = lower_case.clone().map(|l| Ident::new(&format!("mark_{l}"), l.span()));
    let mark_with_reason = lower_case.clone().map(|l| Ident::new(&format!("mark_{l}_with_reason"), l.span()));
    let mark_not = lower_case.clone().map(|l| Ident::new(&format!("mark_not_{l}"), l.span()));
    let mark_unknown = lower_case.clone().map(|l| Ident::new(&format!("mark_{l}_unknown"), l.span()));

    let condition_type_name = Ident::new(&format!("{name}Type"), name.span());
    let condition_type_doc = format!("A [`ConditionType`] that implement this trait duck types to [`{name}`].");
    let manager_name = Ident::new(&format!("{name}Manager"), name.span());
    let manager_doc = format!("Allows a status to manage [`{name}`].");

    Ok(quote! {
        #[doc = #condition_type_doc]
        pub trait #condition_type_name: ::knative_conditions::ConditionType {
            #(
                #[doc = #lower_case_doc]
                fn #lower_case() -> Self;
            )*
        }

        #[automatically_derived]
        impl #condition_type_name for #name {
            #(
                #[inline]
                fn #lower_case_again() -> Self {
                    #name::#capitalized
                }
            )*
        }

        #[automatically_derived]
        impl ::knative_conditions::ConditionType for #name {
            #[inline]
            fn happy() -> Self {
                #name::#happy
            }

            #[inline]
            fn dependents() -> &'static [Self] {
                &[#(#name::#dependents),*]
            }

            fn severity(&self) -> ::knative_conditions::ConditionSeverity {
                match self {
                    #(#name::#errors => ::knative_conditions::ConditionSeverity::Error,)*
                    #(#name::#warnings => ::knative_conditions::ConditionSeverity::Warning,)*
                    #[allow(unreachable_patterns)]
                    _ => ::knative_conditions::ConditionSeverity::Warning,
                }
            }
        }

        #[automatically_derived]
        impl Default for #name {
            fn default() -> Self {
                #name::#happy
            }
        }

        #[automatically_derived]
        impl ::std::fmt::Display for #name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                ::std::write!(f, "{:?}", self)
            }
        }

        #[doc = #manager_doc]
        pub trait #manager_name<S>: ::knative_conditions::ConditionAccessor<S>
        where S: #condition_type_name {
            #(
                fn #mark(&mut self) {
                    self.manager().mark_true(S::#lower_case_again_again());
                }

                fn #mark_with_reason(&mut self, reason: &str, message: Option<String>) {
                    self.manager().mark_true_with_reason(S::#lower_case_again_again(), reason, message);
                }

                fn #mark_not(&mut self, reason: &str, message: Option<String>) {
                    self.manager().mark_false(S::#lower_case_again_again(), reason, message);
                }

                fn #mark_unknown(&mut self, reason: &str, message: Option<String>) {
                    self.manager().mark_unknown(S::#lower_case_again_again(), reason, message);
                }
            )*
        }

        impl<S: #condition_type_name, T: ::knative_conditions::ConditionAccessor<S> + ?Sized> #manager_name<S> for T {}
    }.into())
}
