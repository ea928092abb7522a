//! Live host objects exposed to script through proxies.
//!
//! A facade is a `Proxy` over an empty target. The target only carries the
//! facade id in a private slot; every trap resolves the id back to the
//! [`HostObject`] and asks it at access time, so script always observes the
//! host object's current state and writes land on the host object itself.

use crate::error::{Error, Result};
use crate::runtime::function::HostFunction;
use crate::runtime::scope::{self, BridgeScope};
use crate::runtime::value::HostValue;
use deno_core::v8;
use std::collections::HashMap;
use std::sync::Arc;

/// A host object reflected into script.
///
/// Implementations use interior mutability; the facade only ever holds a
/// shared reference.
pub trait HostObject: Send + Sync + 'static {
    /// Name used in diagnostics and `display_string`.
    fn type_name(&self) -> &str;

    /// Declared members, queried on every access.
    fn members(&self) -> Vec<Member>;

    fn member(&self, name: &str) -> Option<Member> {
        self.members().into_iter().find(|member| member.name == name)
    }

    fn get_field(&self, name: &str) -> Result<HostValue>;

    fn set_field(&self, name: &str, _value: HostValue) -> Result<()> {
        Err(Error::conversion(format!(
            "Field '{}' of {} is read-only",
            name,
            self.type_name()
        )))
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> Result<HostValue>;

    /// Element count for sequence-like objects.
    fn sequence_len(&self) -> Option<usize> {
        None
    }

    fn get_index(&self, _index: usize) -> Result<HostValue> {
        Ok(HostValue::Null)
    }

    /// Store an element; `Ok(false)` rejects the write.
    fn set_index(&self, _index: usize, _value: HostValue) -> Result<bool> {
        Ok(false)
    }
}

pub type HostObjectRef = Arc<dyn HostObject>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field { writable: bool },
    Method { arity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub kind: MemberKind,
}

impl Member {
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Field { writable: false },
        }
    }

    pub fn field_mut(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Field { writable: true },
        }
    }

    pub fn method(name: impl Into<String>, arity: usize) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Method { arity },
        }
    }
}

fn object_key(object: &HostObjectRef) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

struct FacadeEntry {
    object: HostObjectRef,
    proxy: v8::Weak<v8::Proxy>,
    methods: HashMap<String, v8::Global<v8::Function>>,
}

/// Facades currently reachable from script.
#[derive(Default)]
pub(crate) struct FacadeTable {
    entries: HashMap<u64, FacadeEntry>,
    by_object: HashMap<usize, u64>,
    handler: Option<v8::Global<v8::Object>>,
    sweep_at: usize,
}

const MIN_SWEEP: usize = 64;

impl FacadeTable {
    fn object(&self, id: u64) -> Option<HostObjectRef> {
        self.entries.get(&id).map(|entry| entry.object.clone())
    }

    fn live<'s>(&self, object: &HostObjectRef, scope: &mut v8::HandleScope<'s>) -> Option<v8::Local<'s, v8::Proxy>> {
        let id = self.by_object.get(&object_key(object))?;
        self.entries.get(id)?.proxy.to_local(scope)
    }

    fn insert(&mut self, id: u64, object: HostObjectRef, proxy: v8::Weak<v8::Proxy>) {
        if self.entries.len() >= self.sweep_at {
            self.sweep();
        }
        self.by_object.insert(object_key(&object), id);
        self.entries.insert(
            id,
            FacadeEntry {
                object,
                proxy,
                methods: HashMap::new(),
            },
        );
    }

    fn method<'s>(&self, id: u64, name: &str, scope: &mut v8::HandleScope<'s>) -> Option<v8::Local<'s, v8::Function>> {
        let method = self.entries.get(&id)?.methods.get(name)?;
        Some(v8::Local::new(scope, method))
    }

    fn cache_method(&mut self, id: u64, name: &str, method: v8::Global<v8::Function>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.methods.insert(name.to_string(), method);
        }
    }

    pub(crate) fn sweep(&mut self) {
        self.entries.retain(|_, entry| !entry.proxy.is_empty());
        let entries = &self.entries;
        self.by_object.retain(|_, id| entries.contains_key(id));
        self.sweep_at = (self.entries.len() * 2).max(MIN_SWEEP);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.by_object.clear();
        self.handler = None;
        count
    }
}

const FACADE_MARKER: &str = "jsbridge.facade";

fn facade_key<'s>(scope: &mut v8::HandleScope<'s>) -> Option<v8::Local<'s, v8::Private>> {
    let name = v8::String::new(scope, FACADE_MARKER)?;
    Some(v8::Private::for_api(scope, Some(name)))
}

fn facade_id(scope: &mut v8::HandleScope<'_>, target: v8::Local<'_, v8::Value>) -> Option<u64> {
    let target = v8::Local::<v8::Object>::try_from(target).ok()?;
    let key = facade_key(scope)?;
    let id = target.get_private(scope, key)?;
    v8::Local::<v8::Number>::try_from(id)
        .ok()
        .map(|id| id.value() as u64)
}

impl<'a, 's> BridgeScope<'a, 's> {
    /// Proxy exposing `object` to script; one live proxy per object.
    pub fn create_facade(&mut self, object: HostObjectRef) -> Result<v8::Local<'s, v8::Value>> {
        if let Some(existing) = self.state.facades.borrow().live(&object, self.scope) {
            return Ok(existing.into());
        }

        let handler = self.facade_handler()?;
        let id = self.state.next_id();
        let target = v8::Object::new(self.scope);
        let key = facade_key(self.scope).ok_or_else(|| Error::runtime("Failed to create facade key"))?;
        let marker = v8::Number::new(self.scope, id as f64);
        target.set_private(self.scope, key, marker.into());

        let proxy = v8::Proxy::new(self.scope, target, handler)
            .ok_or_else(|| Error::runtime("Failed to create host object proxy"))?;
        let weak = v8::Weak::new(self.scope, proxy);
        tracing::trace!(target: "jsbridge::runtime", id, type_name = object.type_name(), "created facade");
        self.state.facades.borrow_mut().insert(id, object, weak);
        Ok(proxy.into())
    }

    /// Host object behind a facade proxy, if `proxy` is one of ours.
    pub(crate) fn facade_object(&mut self, proxy: v8::Local<'s, v8::Proxy>) -> Option<HostObjectRef> {
        let target = proxy.get_target(self.scope);
        let id = facade_id(self.scope, target)?;
        self.state.facades.borrow().object(id)
    }

    fn facade_handler(&mut self) -> Result<v8::Local<'s, v8::Object>> {
        if let Some(handler) = &self.state.facades.borrow().handler {
            return Ok(v8::Local::new(self.scope, handler));
        }

        let handler = v8::Object::new(self.scope);
        self.add_trap(handler, "get", trap_get)?;
        self.add_trap(handler, "set", trap_set)?;
        self.add_trap(handler, "has", trap_has)?;
        self.add_trap(handler, "deleteProperty", trap_delete)?;
        self.add_trap(handler, "ownKeys", trap_own_keys)?;
        self.add_trap(handler, "getOwnPropertyDescriptor", trap_descriptor)?;
        self.add_trap(handler, "defineProperty", trap_define)?;

        let global = v8::Global::new(self.scope, handler);
        self.state.facades.borrow_mut().handler = Some(global);
        Ok(handler)
    }

    fn add_trap(
        &mut self,
        handler: v8::Local<'s, v8::Object>,
        name: &str,
        callback: impl v8::MapFnTo<v8::FunctionCallback>,
    ) -> Result<()> {
        let trap = v8::Function::builder(callback)
            .build(self.scope)
            .ok_or_else(|| Error::runtime(format!("Failed to create '{}' trap", name)))?;
        let key = self.string(name)?;
        handler.set(self.scope, key.into(), trap.into());
        Ok(())
    }

    fn facade_method(&mut self, facade: &Facade, name: &str, arity: usize) -> Result<v8::Local<'s, v8::Value>> {
        if let Some(method) = self.state.facades.borrow().method(facade.id, name, self.scope) {
            return Ok(method.into());
        }

        let object = facade.object.clone();
        let method_name = name.to_string();
        let function = HostFunction::new(name, arity, move |args| object.call_method(&method_name, args));
        let function = self.function_value(function)?;
        let global = v8::Global::new(self.scope, function);
        self.state.facades.borrow_mut().cache_method(facade.id, name, global);
        Ok(function.into())
    }

    fn undefined(&mut self) -> v8::Local<'s, v8::Value> {
        v8::undefined(self.scope).into()
    }

    fn boolean(&mut self, value: bool) -> v8::Local<'s, v8::Value> {
        v8::Boolean::new(self.scope, value).into()
    }
}

struct Facade {
    id: u64,
    object: HostObjectRef,
}

/// Resolve the facade behind a trap's target and run `trap` on it.
fn with_facade<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
    trap: impl FnOnce(&mut BridgeScope<'_, 's>, &Facade, &[v8::Local<'s, v8::Value>]) -> Result<v8::Local<'s, v8::Value>>,
) {
    let Some(state) = scope::current_state() else {
        return;
    };
    let values: Vec<v8::Local<'s, v8::Value>> = (0..args.length()).map(|i| args.get(i)).collect();
    let facade = values
        .first()
        .and_then(|target| facade_id(scope, *target))
        .and_then(|id| state.facades.borrow().object(id).map(|object| Facade { id, object }));

    scope::enter(scope, |scope| {
        let mut cx = BridgeScope::new(scope, state);
        let Some(facade) = facade else {
            cx.throw(&Error::runtime("Host object facade was released"));
            return;
        };
        match trap(&mut cx, &facade, &values) {
            Ok(value) => rv.set(value),
            Err(err) => {
                if !cx.scope.is_execution_terminating() {
                    cx.throw(&err);
                }
            }
        }
    });
}

/// Property name of a trap argument; `None` for symbols.
fn property_key(cx: &mut BridgeScope<'_, '_>, args: &[v8::Local<'_, v8::Value>]) -> Option<String> {
    let key = args.get(1)?;
    if key.is_symbol() {
        return None;
    }
    Some(key.to_rust_string_lossy(cx.scope))
}

/// Canonical array index (`"0"`, `"12"`, never `"01"`).
fn parse_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

enum Slot {
    Length(usize),
    Index(usize),
    Member(Member),
    Missing,
}

fn resolve_slot(object: &HostObjectRef, key: &str) -> Slot {
    if let Some(len) = object.sequence_len() {
        if key == "length" {
            return Slot::Length(len);
        }
        if let Some(index) = parse_index(key) {
            return if index < len { Slot::Index(index) } else { Slot::Missing };
        }
    }
    match object.member(key) {
        Some(member) => Slot::Member(member),
        None => Slot::Missing,
    }
}

fn read_slot<'s>(
    cx: &mut BridgeScope<'_, 's>,
    facade: &Facade,
    key: &str,
    slot: &Slot,
) -> Result<v8::Local<'s, v8::Value>> {
    match slot {
        Slot::Length(len) => Ok(v8::Number::new(cx.scope, *len as f64).into()),
        Slot::Index(index) => {
            let value = facade.object.get_index(*index)?;
            cx.to_engine(value)
        }
        Slot::Member(Member {
            kind: MemberKind::Field { .. },
            ..
        }) => {
            let value = facade.object.get_field(key)?;
            cx.to_engine(value)
        }
        Slot::Member(Member {
            kind: MemberKind::Method { arity },
            ..
        }) => cx.facade_method(facade, key, *arity),
        Slot::Missing => Ok(cx.undefined()),
    }
}

fn write_slot<'s>(
    cx: &mut BridgeScope<'_, 's>,
    facade: &Facade,
    key: &str,
    value: v8::Local<'s, v8::Value>,
) -> Result<bool> {
    match resolve_slot(&facade.object, key) {
        Slot::Index(index) => {
            let value = cx.to_host(value)?;
            facade.object.set_index(index, value)
        }
        Slot::Member(Member {
            kind: MemberKind::Field { writable: true },
            ..
        }) => {
            let value = cx.to_host(value)?;
            facade.object.set_field(key, value)?;
            Ok(true)
        }
        _ => {
            tracing::trace!(
                target: "jsbridge::runtime",
                type_name = facade.object.type_name(),
                key,
                "rejected write to facade"
            );
            Ok(false)
        }
    }
}

fn trap_get<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, rv: v8::ReturnValue) {
    with_facade(scope, args, rv, |cx, facade, args| {
        let Some(key) = property_key(cx, args) else {
            return Ok(cx.undefined());
        };
        let slot = resolve_slot(&facade.object, &key);
        read_slot(cx, facade, &key, &slot)
    });
}

fn trap_set<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, rv: v8::ReturnValue) {
    with_facade(scope, args, rv, |cx, facade, args| {
        let accepted = match (property_key(cx, args), args.get(2)) {
            (Some(key), Some(value)) => write_slot(cx, facade, &key, *value)?,
            _ => false,
        };
        Ok(cx.boolean(accepted))
    });
}

fn trap_has<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, rv: v8::ReturnValue) {
    with_facade(scope, args, rv, |cx, facade, args| {
        let present = match property_key(cx, args) {
            Some(key) => !matches!(resolve_slot(&facade.object, &key), Slot::Missing),
            None => false,
        };
        Ok(cx.boolean(present))
    });
}

fn trap_delete<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, rv: v8::ReturnValue) {
    with_facade(scope, args, rv, |cx, _, _| Ok(cx.boolean(false)));
}

fn trap_own_keys<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, rv: v8::ReturnValue) {
    with_facade(scope, args, rv, |cx, facade, _| {
        let len = facade.object.sequence_len().unwrap_or(0);
        let names = (0..len)
            .map(|index| index.to_string())
            .chain(facade.object.members().into_iter().map(|member| member.name));
        let mut keys: Vec<v8::Local<v8::Value>> = Vec::with_capacity(len);
        for name in names {
            keys.push(cx.string(&name)?.into());
        }
        Ok(v8::Array::new_with_elements(cx.scope, &keys).into())
    });
}

fn trap_descriptor<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, rv: v8::ReturnValue) {
    with_facade(scope, args, rv, |cx, facade, args| {
        let Some(key) = property_key(cx, args) else {
            return Ok(cx.undefined());
        };
        let slot = resolve_slot(&facade.object, &key);
        let (writable, enumerable) = match &slot {
            Slot::Missing => return Ok(cx.undefined()),
            Slot::Length(_) => (false, false),
            Slot::Index(_) => (true, true),
            Slot::Member(Member {
                kind: MemberKind::Field { writable },
                ..
            }) => (*writable, true),
            Slot::Member(_) => (false, true),
        };
        let value = read_slot(cx, facade, &key, &slot)?;

        let descriptor = v8::Object::new(cx.scope);
        let fields = [
            ("value", value),
            ("writable", cx.boolean(writable)),
            ("enumerable", cx.boolean(enumerable)),
            ("configurable", cx.boolean(true)),
        ];
        for (name, field) in fields {
            let name = cx.string(name)?;
            descriptor.set(cx.scope, name.into(), field);
        }
        Ok(descriptor.into())
    });
}

fn trap_define<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, rv: v8::ReturnValue) {
    with_facade(scope, args, rv, |cx, facade, args| {
        let key = property_key(cx, args);
        let descriptor = args
            .get(2)
            .and_then(|value| v8::Local::<v8::Object>::try_from(*value).ok());
        let accepted = match (key, descriptor) {
            (Some(key), Some(descriptor)) => {
                let name = cx.string("value")?;
                let has_value = descriptor.has(cx.scope, name.into()).unwrap_or(false);
                match descriptor.get(cx.scope, name.into()) {
                    Some(value) if has_value => write_slot(cx, facade, &key, value)?,
                    _ => false,
                }
            }
            _ => false,
        };
        Ok(cx.boolean(accepted))
    });
}
