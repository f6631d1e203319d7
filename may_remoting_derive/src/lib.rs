#![recursion_limit = "512"]

extern crate proc_macro;
extern crate proc_macro2;
extern crate quote;
extern crate syn;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote, ToTokens};
use syn::{
    braced,
    ext::IdentExt,
    parenthesized,
    parse::{Parse, ParseStream},
    parse_macro_input, parse_quote,
    spanned::Spanned,
    Attribute, FnArg, Ident, LitStr, Pat, PatType, ReturnType, Token, Type, Visibility,
};

/// Accumulates multiple errors into a result.
/// Only use this for recoverable errors, i.e. non-parse errors. Fatal errors should early exit to
/// avoid further complications.
macro_rules! extend_errors {
    ($errors: ident, $e: expr) => {
        match $errors {
            Ok(_) => $errors = Err($e),
            Err(ref mut errors) => errors.extend($e),
        }
    };
}

#[allow(unused_macros)]
macro_rules! d {
    ($v: expr) => {{
        eprintln!("{} = {:#?}", stringify!($v), $v);
    }};
}

// names taken by the generated client stub
const RESERVED: &[&str] = &["new", "connect", "handle"];

struct Service {
    attrs: Vec<Attribute>,
    vis: Visibility,
    ident: Ident,
    rpcs: Vec<RpcMethod>,
}

struct RpcMethod {
    attrs: Vec<Attribute>,
    ident: Ident,
    args: Vec<PatType>,
    output: ReturnType,
}

impl Parse for Service {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let attrs = input.call(Attribute::parse_outer)?;
        let vis = input.parse()?;
        input.parse::<Token![trait]>()?;
        let ident: Ident = input.parse()?;
        let content;
        braced!(content in input);
        let mut rpcs = Vec::<RpcMethod>::new();
        while !content.is_empty() {
            rpcs.push(content.parse()?);
        }
        let mut ident_errors = Ok(());
        for rpc in &rpcs {
            let name = rpc.ident.unraw().to_string();
            if RESERVED.contains(&name.as_str()) {
                extend_errors!(
                    ident_errors,
                    syn::Error::new(
                        rpc.ident.span(),
                        format!(
                            "method name conflicts with generated fn `{}Client::{}`",
                            ident.unraw(),
                            name
                        )
                    )
                );
            }
            let async_name = format!("{name}_async");
            if rpcs.iter().any(|other| other.ident.unraw() == async_name) {
                extend_errors!(
                    ident_errors,
                    syn::Error::new(
                        rpc.ident.span(),
                        format!("method name conflicts with generated fn `{async_name}`")
                    )
                );
            }
        }
        ident_errors?;

        Ok(Self {
            attrs,
            vis,
            ident,
            rpcs,
        })
    }
}

impl Parse for RpcMethod {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let attrs = input.call(Attribute::parse_outer)?;
        input.parse::<Token![fn]>()?;
        let ident = input.parse()?;
        let content;
        parenthesized!(content in input);
        let mut args = Vec::new();
        let mut errors = Ok(());
        let mut found_self = false;
        for arg in content.parse_terminated(FnArg::parse, Token![,])? {
            match arg {
                FnArg::Typed(captured) if matches!(&*captured.pat, Pat::Ident(_)) => {
                    args.push(captured);
                }
                FnArg::Typed(captured) => {
                    extend_errors!(
                        errors,
                        syn::Error::new(captured.pat.span(), "patterns aren't allowed in RPC args")
                    );
                }
                FnArg::Receiver(me) => {
                    found_self = true;
                    if me.mutability.is_some() {
                        extend_errors!(errors, syn::Error::new(me.span(), "self can't be mutable"));
                    }
                    if me.reference.is_none() {
                        extend_errors!(errors, syn::Error::new(me.span(), "self must be &self"));
                    }
                }
            }
        }
        if !found_self {
            extend_errors!(
                errors,
                syn::Error::new(content.span(), "rpc method must start with &self")
            );
        }
        errors?;
        let output = input.parse()?;
        input.parse::<Token![;]>()?;

        Ok(Self {
            attrs,
            ident,
            args,
            output,
        })
    }
}

/// A helper attribute to avoid a direct dependency on Serde.
///
/// Adds the following annotations to the annotated item:
///
/// ```rust
/// #[derive(may_remoting::serde::Serialize, may_remoting::serde::Deserialize)]
/// #[serde(crate = "may_remoting::serde")]
/// # struct Foo;
/// ```
#[proc_macro_attribute]
pub fn derive_serde(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut gen: proc_macro2::TokenStream = quote! {
        #[derive(may_remoting::serde::Serialize, may_remoting::serde::Deserialize)]
        #[serde(crate = "may_remoting::serde")]
    };
    gen.extend(proc_macro2::TokenStream::from(item));
    proc_macro::TokenStream::from(gen)
}

/// Generates:
/// - service trait
/// - client stub struct, with a blocking and an async fn per method
/// - dispatch service trait
#[proc_macro_attribute]
pub fn service(attr: TokenStream, input: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "may_remoting::service does not support this attr item",
        )
        .to_compile_error()
        .into();
    }

    let unit_type: &Type = &parse_quote!(());
    let Service {
        ref attrs,
        ref vis,
        ref ident,
        ref rpcs,
    } = parse_macro_input!(input as Service);

    let args: &[&[PatType]] = &rpcs.iter().map(|rpc| &*rpc.args).collect::<Vec<_>>();
    let methods = rpcs.iter().map(|rpc| &rpc.ident).collect::<Vec<_>>();

    let generator = ServiceGenerator {
        service_ident: ident,
        client_ident: &format_ident!("{}Client", ident),
        vis,
        args,
        method_attrs: &rpcs.iter().map(|rpc| &*rpc.attrs).collect::<Vec<_>>(),
        method_idents: &methods,
        async_idents: &methods
            .iter()
            .map(|m| format_ident!("{}_async", m.unraw()))
            .collect::<Vec<_>>(),
        method_names: &methods
            .iter()
            .map(|m| LitStr::new(&m.unraw().to_string(), m.span()))
            .collect::<Vec<_>>(),
        attrs,
        rpcs,
        return_types: &rpcs
            .iter()
            .map(|rpc| match rpc.output {
                ReturnType::Type(_, ref ty) => ty,
                ReturnType::Default => unit_type,
            })
            .collect::<Vec<_>>(),
        arg_pats: &args
            .iter()
            .map(|args| args.iter().map(|arg| &*arg.pat).collect())
            .collect::<Vec<_>>(),
        arg_types: &args
            .iter()
            .map(|args| args.iter().map(|arg| &*arg.ty).collect())
            .collect::<Vec<_>>(),
        param_types: &args
            .iter()
            .map(|args| args.iter().map(|arg| param_type(&arg.ty)).collect())
            .collect::<Vec<_>>(),
    };
    let code = generator.into_token_stream();
    // eprintln!("{}", code);
    code.into()
}

// the declared type as sent on the wire, e.g. `Vec<u8>`
fn param_type(ty: &Type) -> LitStr {
    let name = ty.to_token_stream().to_string().replace(' ', "");
    LitStr::new(&name, ty.span())
}

// Things needed to generate the service items: trait, dispatch adapter and the client stub.
struct ServiceGenerator<'a> {
    service_ident: &'a Ident,
    client_ident: &'a Ident,
    vis: &'a Visibility,
    attrs: &'a [Attribute],
    rpcs: &'a [RpcMethod],
    method_idents: &'a [&'a Ident],
    async_idents: &'a [Ident],
    method_names: &'a [LitStr],
    method_attrs: &'a [&'a [Attribute]],
    args: &'a [&'a [PatType]],
    return_types: &'a [&'a Type],
    arg_pats: &'a [Vec<&'a Pat>],
    arg_types: &'a [Vec<&'a Type>],
    param_types: &'a [Vec<LitStr>],
}

impl<'a> ServiceGenerator<'a> {
    fn trait_service(&self) -> TokenStream2 {
        let &Self {
            attrs,
            rpcs,
            vis,
            return_types,
            service_ident,
            ..
        } = self;

        let types_and_fns = rpcs.iter().zip(return_types.iter()).map(
            |(
                RpcMethod {
                    attrs, ident, args, ..
                },
                output,
            )| {
                quote! {
                    #( #attrs )*
                    fn #ident(&self, #( #args ),*) -> #output;
                }
            },
        );

        quote! {
            #( #attrs )*
            #vis trait #service_ident: Sized {
                #( #types_and_fns )*
            }
        }
    }

    fn impl_dispatch_for_server(&self) -> TokenStream2 {
        let &Self {
            service_ident,
            method_idents,
            method_names,
            param_types,
            arg_pats,
            arg_types,
            vis,
            ..
        } = self;

        let dispatch_service_indent = format_ident!("{}ServiceDispatch", service_ident);
        quote! {
            #vis trait #dispatch_service_indent: #service_ident + Send + Sync + 'static
            {
                fn dispatch_req(
                    &self,
                    method: &may_remoting::MethodId,
                    args: &[u8],
                    responder: may_remoting::Responder,
                ) -> Result<(), may_remoting::Error> {
                    use may_remoting::Serializer;
                    #(
                        if method.matches(#method_names, &[#( #param_types ),*]) {
                            // deserialize the arguments
                            let ( #( #arg_pats, )* ): ( #( #arg_types, )* ) =
                                may_remoting::Bincode.decode(args)?;
                            let ret = self.#method_idents(#( #arg_pats ),*);
                            responder.respond_with(&may_remoting::Bincode, &ret);
                            return Ok(());
                        }
                    )*
                    Err(may_remoting::Error::UnknownMethod(method.to_string()))
                }
            }

            impl<T: #service_ident + Send + Sync + 'static> #dispatch_service_indent for T {}
        }
    }

    fn struct_client(&self) -> TokenStream2 {
        let &Self {
            vis, client_ident, ..
        } = self;

        quote! {
            #[allow(unused)]
            #[derive(Debug, Clone)]
            /// The client stub that makes RPC calls to the server.
            #vis struct #client_ident {
                handle: may_remoting::ServiceHandle<may_remoting::Bincode>,
            }
        }
    }

    fn impl_client_new(&self) -> TokenStream2 {
        let &Self {
            client_ident, vis, ..
        } = self;

        quote! {
            impl #client_ident {
                /// Returns a new client stub that forwards calls through the handle.
                #vis fn new(handle: may_remoting::ServiceHandle<may_remoting::Bincode>) -> Self {
                    Self { handle }
                }

                /// Returns a client stub for the service registered as `service_id` at `addr`.
                #vis fn connect(
                    invoker: &may_remoting::ClientInvoker,
                    addr: std::net::SocketAddr,
                    service_id: &str,
                ) -> Self {
                    Self::new(invoker.proxy(addr, service_id, may_remoting::Bincode))
                }

                /// the underlying service handle
                #vis fn handle(&self) -> &may_remoting::ServiceHandle<may_remoting::Bincode> {
                    &self.handle
                }
            }
        }
    }

    fn impl_client_rpc_methods(&self) -> TokenStream2 {
        let &Self {
            client_ident,
            method_attrs,
            vis,
            method_idents,
            async_idents,
            method_names,
            param_types,
            args,
            return_types,
            arg_pats,
            ..
        } = self;

        quote! {
            impl #client_ident {
                #(
                    #[allow(unused)]
                    #( #method_attrs )*
                    #vis fn #method_idents(&self, #( #args ),*) -> Result<#return_types, may_remoting::Error> {
                        self.handle.call(
                            #method_names,
                            &[#( #param_types ),*],
                            &( #( #arg_pats, )* ),
                        )
                    }

                    #[allow(unused)]
                    #( #method_attrs )*
                    #vis fn #async_idents<C>(&self, #( #args, )* callback: C) -> Result<(), may_remoting::Error>
                    where
                        C: may_remoting::Callback<#return_types>,
                    {
                        self.handle.call_async(
                            #method_names,
                            &[#( #param_types ),*],
                            &( #( #arg_pats, )* ),
                            callback,
                            None,
                        )
                    }
                )*
            }
        }
    }
}

impl<'a> ToTokens for ServiceGenerator<'a> {
    fn to_tokens(&self, output: &mut TokenStream2) {
        output.extend(vec![
            self.trait_service(),
            self.struct_client(),
            self.impl_client_new(),
            self.impl_client_rpc_methods(),
            self.impl_dispatch_for_server(),
        ])
    }
}

fn get_attr(attr_ident: &str, attrs: Vec<syn::Attribute>) -> Option<syn::Attribute> {
    attrs
        .into_iter()
        .find(|attr| attr.path().segments.len() == 1 && attr.path().segments[0].ident == attr_ident)
}

fn get_service_from_attr(attr: Option<syn::Attribute>) -> Result<syn::Path, syn::Error> {
    match attr {
        Some(a) => match a.meta {
            syn::Meta::List(l) => l.parse_args(),
            _ => Err(syn::Error::new(
                a.span(),
                "`service` attributes need at least one param",
            )),
        },
        None => Err(syn::Error::new(
            attr.span(),
            "expected `service` attributes",
        )),
    }
}

/// Implements `may_remoting::Service` for a struct that implements a
/// `#[service]` trait, named by the `#[service(Trait)]` attribute.
#[proc_macro_derive(Service, attributes(service))]
pub fn derive_rpc_service(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as syn::DeriveInput);
    let struct_ident = ast.ident;
    let attrs = ast.attrs;

    let service_attr = get_attr("service", attrs);
    let service = get_service_from_attr(service_attr);

    let mut service = match service {
        Err(err) => return err.to_compile_error().into(),
        Ok(s) => s,
    };

    if let Some(seg) = service.segments.last_mut() {
        seg.ident = Ident::new(
            &format!("{}ServiceDispatch", seg.ident.to_token_stream()),
            seg.span(),
        );
    }

    let out = quote!(
        impl may_remoting::Service for #struct_ident {
            fn invoke(
                &self,
                method: &may_remoting::MethodId,
                args: &[u8],
                responder: may_remoting::Responder,
            ) -> Result<(), may_remoting::Error> {
                use #service;
                // resolve the method and answer
                self.dispatch_req(method, args, responder)
            }
        }
    );
    // eprintln!("{}", out);
    out.into()
}
