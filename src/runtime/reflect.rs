//! Declarative host classes.
//!
//! Rust has no runtime reflection, so a [`HostClass`] spells out which fields
//! and methods of a native type script may see. Instances are shared with
//! script as live facades while host code keeps working on the same value.

use crate::error::{Error, Result};
use crate::runtime::facade::{HostObject, Member};
use crate::runtime::value::HostValue;
use std::sync::{Arc, Mutex, MutexGuard};

type Getter<T> = Box<dyn Fn(&T) -> HostValue + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, HostValue) -> Result<()> + Send + Sync>;
type MethodFn<T> = Box<dyn Fn(&Reflected<T>, Vec<HostValue>) -> Result<HostValue> + Send + Sync>;

enum ClassMember<T> {
    Field { get: Getter<T>, set: Option<Setter<T>> },
    Method { arity: usize, call: MethodFn<T> },
}

struct ClassDef<T> {
    name: String,
    members: Vec<(String, ClassMember<T>)>,
}

impl<T> ClassDef<T> {
    fn find(&self, name: &str) -> Option<&ClassMember<T>> {
        self.members
            .iter()
            .find(|(member, _)| member == name)
            .map(|(_, member)| member)
    }
}

/// Builder describing the script-visible surface of `T`.
pub struct HostClass<T> {
    def: Arc<ClassDef<T>>,
}

impl<T> Clone for HostClass<T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
        }
    }
}

impl<T: Send + 'static> HostClass<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: Arc::new(ClassDef {
                name: name.into(),
                members: Vec::new(),
            }),
        }
    }

    fn push(mut self, name: impl Into<String>, member: ClassMember<T>) -> Self {
        let name = name.into();
        match Arc::get_mut(&mut self.def) {
            Some(def) => {
                def.members.retain(|(existing, _)| *existing != name);
                def.members.push((name, member));
                self
            }
            None => {
                tracing::warn!(
                    target: "jsbridge::runtime",
                    class = %self.def.name,
                    member = %name,
                    "host class already shared, member ignored"
                );
                self
            }
        }
    }

    /// Read-only field.
    pub fn field<G>(self, name: impl Into<String>, get: G) -> Self
    where
        G: Fn(&T) -> HostValue + Send + Sync + 'static,
    {
        self.push(
            name,
            ClassMember::Field {
                get: Box::new(get),
                set: None,
            },
        )
    }

    /// Field script may assign to.
    pub fn field_mut<G, S>(self, name: impl Into<String>, get: G, set: S) -> Self
    where
        G: Fn(&T) -> HostValue + Send + Sync + 'static,
        S: Fn(&mut T, HostValue) -> Result<()> + Send + Sync + 'static,
    {
        self.push(
            name,
            ClassMember::Field {
                get: Box::new(get),
                set: Some(Box::new(set)),
            },
        )
    }

    /// Method taking `arity` arguments.
    ///
    /// The instance is not locked while the method runs. Use
    /// [`Reflected::with`] or [`Reflected::with_mut`] around the parts that
    /// touch `T`, and call back into script outside of them.
    pub fn method<F>(self, name: impl Into<String>, arity: usize, call: F) -> Self
    where
        F: Fn(&Reflected<T>, Vec<HostValue>) -> Result<HostValue> + Send + Sync + 'static,
    {
        self.push(
            name,
            ClassMember::Method {
                arity,
                call: Box::new(call),
            },
        )
    }

    pub fn instantiate(&self, value: T) -> Arc<Reflected<T>> {
        Arc::new(Reflected {
            def: self.def.clone(),
            value: Mutex::new(value),
        })
    }
}

/// An instance of a [`HostClass`].
pub struct Reflected<T> {
    def: Arc<ClassDef<T>>,
    value: Mutex<T>,
}

impl<T> Reflected<T> {
    fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }
}

impl<T: Send + 'static> HostObject for Reflected<T> {
    fn type_name(&self) -> &str {
        &self.def.name
    }

    fn members(&self) -> Vec<Member> {
        self.def
            .members
            .iter()
            .map(|(name, member)| match member {
                ClassMember::Field { set: Some(_), .. } => Member::field_mut(name.as_str()),
                ClassMember::Field { set: None, .. } => Member::field(name.as_str()),
                ClassMember::Method { arity, .. } => Member::method(name.as_str(), *arity),
            })
            .collect()
    }

    fn get_field(&self, name: &str) -> Result<HostValue> {
        match self.def.find(name) {
            Some(ClassMember::Field { get, .. }) => Ok(get(&self.lock())),
            _ => Err(Error::conversion(format!("{} has no field '{}'", self.def.name, name))),
        }
    }

    fn set_field(&self, name: &str, value: HostValue) -> Result<()> {
        match self.def.find(name) {
            Some(ClassMember::Field { set: Some(set), .. }) => set(&mut self.lock(), value),
            _ => Err(Error::conversion(format!(
                "Field '{}' of {} is read-only",
                name, self.def.name
            ))),
        }
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> Result<HostValue> {
        match self.def.find(name) {
            Some(ClassMember::Method { call, .. }) => call(self, args),
            _ => Err(Error::conversion(format!("{} has no method '{}'", self.def.name, name))),
        }
    }
}

/// Sequence-like host object over a vector of values.
///
/// Script sees `length`, index access and `push`/`pop`.
#[derive(Default)]
pub struct HostList {
    items: Mutex<Vec<HostValue>>,
}

impl HostList {
    pub fn new(items: Vec<HostValue>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HostValue>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn push(&self, value: HostValue) {
        self.lock().push(value);
    }

    pub fn to_vec(&self) -> Vec<HostValue> {
        self.lock().clone()
    }
}

impl HostObject for HostList {
    fn type_name(&self) -> &str {
        "HostList"
    }

    fn members(&self) -> Vec<Member> {
        vec![Member::method("push", 1), Member::method("pop", 0)]
    }

    fn get_field(&self, name: &str) -> Result<HostValue> {
        Err(Error::conversion(format!("HostList has no field '{}'", name)))
    }

    fn call_method(&self, name: &str, mut args: Vec<HostValue>) -> Result<HostValue> {
        let mut items = self.lock();
        match name {
            "push" => {
                items.push(args.pop().unwrap_or(HostValue::Null));
                Ok(HostValue::from(items.len()))
            }
            "pop" => Ok(items.pop().unwrap_or(HostValue::Null)),
            other => Err(Error::conversion(format!("HostList has no method '{}'", other))),
        }
    }

    fn sequence_len(&self) -> Option<usize> {
        Some(self.len())
    }

    fn get_index(&self, index: usize) -> Result<HostValue> {
        Ok(self.lock().get(index).cloned().unwrap_or(HostValue::Null))
    }

    fn set_index(&self, index: usize, value: HostValue) -> Result<bool> {
        match self.lock().get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
