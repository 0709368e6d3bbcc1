use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Marks a unit struct as a pipeline stage. Generates `ID`/`MODULE`/`PHASE`
/// consts plus `plan()` and `exec()` entry points gated on the pipeline
/// config; the struct supplies the runtime body as
/// `fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()>`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Stage(attr: TokenStream, item: TokenStream) -> TokenStream {
    match stage_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Marks a unit struct as a pipeline module that contributes a fixed list of
/// stages. Generates the `Module` (planning) and `ModuleExec` (executor
/// registration) impls.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        out.push(lit_str(e)?);
    }
    Ok(out)
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        match e {
            Expr::Path(ExprPath { path, .. }) => out.push(path.clone()),
            _ => return Err(syn::Error::new(e.span(), "expected path (identifier)")),
        }
    }
    Ok(out)
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Stage" && ident != "Module"
        })
        .cloned()
        .collect()
}

fn stage_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut label: Option<String> = None;
    let mut gate: Option<String> = None;
    let mut after: Vec<String> = Vec::new();
    let mut provides: Vec<String> = Vec::new();

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "module" => module = Some(lit_str(v)?),
            "phase" => phase = Some(lit_str(v)?),
            "label" => label = Some(lit_str(v)?),
            "gate" => gate = Some(lit_str(v)?),
            "after" => after = expr_array_strings(v)?,
            "provides" => provides = expr_array_strings(v)?,
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Stage attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing id"))?;
    let module =
        module.ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing module"))?;
    let phase =
        phase.ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing phase"))?;
    let label =
        label.ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing label"))?;
    let gate = gate.unwrap_or_else(|| "always".to_string());

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;

            pub fn plan(
                cfg: &crate::config::PipelineConfig,
                plan: &mut crate::planner::Plan,
            ) -> crate::Result<()> {
                if !cfg.stage_enabled(#gate) {
                    return Ok(());
                }
                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label: #label.to_string(),
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(
                cfg: &crate::config::PipelineConfig,
                ctx: &mut crate::executor::ExecCtx,
            ) -> crate::Result<()> {
                if !cfg.stage_enabled(#gate) {
                    return Ok(());
                }
                Self::run(cfg, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut gate: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "gate" => gate = Some(lit_str(v)?),
            "tasks" => tasks = Some(expr_array_paths(v)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing id"))?;
    let gate = gate.unwrap_or_else(|| "always".to_string());
    let tasks =
        tasks.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing tasks"))?;

    let call_tasks = tasks.iter().map(|p| quote! { #p::plan(cfg, plan)?; });
    let reg_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #struct_ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, cfg: &crate::config::PipelineConfig) -> bool {
                cfg.stage_enabled(#gate)
            }

            fn plan(
                &self,
                cfg: &crate::config::PipelineConfig,
                plan: &mut crate::planner::Plan,
            ) -> crate::Result<()> {
                #(#call_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #struct_ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
