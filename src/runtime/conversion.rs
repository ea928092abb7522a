//! Conversion between engine values and [`HostValue`].
//!
//! Conversions run on the execution thread with circular reference detection
//! and depth/size limits enforced by [`LimitTracker`].

use crate::error::{Error, Result};
use crate::runtime::scope::BridgeScope;
use crate::runtime::value::{HostValue, LimitTracker, MAX_SAFE_INTEGER};
use deno_core::v8;
use indexmap::IndexMap;

impl<'a, 's> BridgeScope<'a, 's> {
    /// Convert a host value into an engine value.
    pub fn to_engine(&mut self, value: HostValue) -> Result<v8::Local<'s, v8::Value>> {
        let mut tracker = self.state.limit_tracker();
        self.to_engine_internal(value, &mut tracker)
    }

    fn to_engine_internal(
        &mut self,
        value: HostValue,
        tracker: &mut LimitTracker,
    ) -> Result<v8::Local<'s, v8::Value>> {
        tracker.enter()?;

        let result = match value {
            HostValue::Null => {
                tracker.add_bytes(4)?;
                Ok(v8::null(self.scope).into())
            }
            HostValue::Bool(b) => {
                tracker.add_bytes(1)?;
                Ok(v8::Boolean::new(self.scope, b).into())
            }
            HostValue::Int(i) => {
                tracker.add_bytes(8)?;
                if i.unsigned_abs() <= MAX_SAFE_INTEGER as u64 {
                    Ok(v8::Number::new(self.scope, i as f64).into())
                } else {
                    Ok(v8::BigInt::new_from_i64(self.scope, i).into())
                }
            }
            HostValue::Float(f) => {
                tracker.add_bytes(8)?;
                Ok(v8::Number::new(self.scope, f).into())
            }
            HostValue::String(s) => {
                tracker.add_bytes(s.len())?;
                Ok(self.string(&s)?.into())
            }
            HostValue::Bytes(bytes) => {
                tracker.add_bytes(bytes.len())?;
                Ok(self.bytes_value(bytes)?.into())
            }
            HostValue::Array(items) => {
                tracker.add_bytes(items.len().saturating_mul(std::mem::size_of::<usize>()))?;
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    elements.push(self.to_engine_internal(item, tracker)?);
                }
                Ok(v8::Array::new_with_elements(self.scope, &elements).into())
            }
            HostValue::Object(map) => {
                let object = v8::Object::new(self.scope);
                for (key, item) in map {
                    tracker.add_bytes(key.len())?;
                    let key = self.string(&key)?;
                    let item = self.to_engine_internal(item, tracker)?;
                    object
                        .create_data_property(self.scope, key.into(), item)
                        .ok_or_else(|| Error::conversion("Failed to define object property"))?;
                }
                Ok(object.into())
            }
            HostValue::HostObject(object) => {
                tracker.add_bytes(8)?;
                self.create_facade(object)
            }
            HostValue::Function(function) => {
                tracker.add_bytes(8)?;
                Ok(self.function_value(function)?.into())
            }
            HostValue::JsFunction(function) => {
                tracker.add_bytes(8)?;
                Ok(function.local(self)?.into())
            }
            HostValue::Engine(value) => {
                tracker.add_bytes(8)?;
                value.local(self)
            }
        };

        tracker.exit();
        result
    }

    /// `Uint8Array` taking ownership of `bytes` without copying.
    pub fn bytes_value(&mut self, bytes: Vec<u8>) -> Result<v8::Local<'s, v8::Uint8Array>> {
        let len = bytes.len();
        let buffer = if len == 0 {
            v8::ArrayBuffer::new(self.scope, 0)
        } else {
            let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
            v8::ArrayBuffer::with_backing_store(self.scope, &store)
        };
        v8::Uint8Array::new(self.scope, buffer, 0, len)
            .ok_or_else(|| Error::conversion("Failed to create Uint8Array"))
    }

    /// Convert an engine value into a host value.
    pub fn to_host(&mut self, value: v8::Local<'s, v8::Value>) -> Result<HostValue> {
        let mut tracker = self.state.limit_tracker();
        let mut ancestors = Vec::new();
        self.to_host_internal(value, None, &mut ancestors, &mut tracker)
    }

    fn to_host_internal(
        &mut self,
        value: v8::Local<'s, v8::Value>,
        receiver: Option<v8::Local<'s, v8::Value>>,
        ancestors: &mut Vec<v8::Local<'s, v8::Object>>,
        tracker: &mut LimitTracker,
    ) -> Result<HostValue> {
        tracker.enter()?;

        let result = if value.is_null_or_undefined() {
            tracker.add_bytes(4)?;
            Ok(HostValue::Null)
        } else if value.is_boolean() {
            tracker.add_bytes(1)?;
            Ok(HostValue::Bool(value.boolean_value(self.scope)))
        } else if value.is_number() {
            tracker.add_bytes(8)?;
            let number = value.number_value(self.scope).unwrap_or(f64::NAN);
            Ok(number_to_host(number))
        } else if value.is_string() {
            let string = value.to_rust_string_lossy(self.scope);
            tracker.add_bytes(string.len())?;
            Ok(HostValue::String(string))
        } else if value.is_big_int() {
            tracker.add_bytes(8)?;
            let bigint = v8::Local::<v8::BigInt>::try_from(value)
                .map_err(|_| Error::conversion("Failed to cast to BigInt"))?;
            match bigint.i64_value() {
                (i, true) => Ok(HostValue::Int(i)),
                (_, false) => Err(Error::conversion("BigInt value too large to represent as i64")),
            }
        } else if value.is_symbol() {
            Err(Error::conversion("Cannot convert a Symbol to a host value"))
        } else if value.is_proxy() {
            tracker.add_bytes(8)?;
            let proxy = v8::Local::<v8::Proxy>::try_from(value)
                .map_err(|_| Error::conversion("Failed to cast to Proxy"))?;
            match self.facade_object(proxy) {
                Some(object) => Ok(HostValue::HostObject(object)),
                None => Ok(HostValue::Engine(self.pin(value))),
            }
        } else if value.is_function() {
            tracker.add_bytes(8)?;
            let function = v8::Local::<v8::Function>::try_from(value)
                .map_err(|_| Error::conversion("Failed to cast to function"))?;
            Ok(HostValue::JsFunction(self.pin_function(function, receiver)))
        } else if value.is_promise() {
            tracker.add_bytes(8)?;
            Ok(HostValue::Engine(self.pin(value)))
        } else if value.is_array_buffer_view() {
            let view = v8::Local::<v8::ArrayBufferView>::try_from(value)
                .map_err(|_| Error::conversion("Failed to cast to ArrayBufferView"))?;
            tracker.add_bytes(view.byte_length())?;
            let mut bytes = vec![0u8; view.byte_length()];
            let copied = view.copy_contents(&mut bytes);
            bytes.truncate(copied);
            Ok(HostValue::Bytes(bytes))
        } else if value.is_array_buffer() {
            let buffer = v8::Local::<v8::ArrayBuffer>::try_from(value)
                .map_err(|_| Error::conversion("Failed to cast to ArrayBuffer"))?;
            let len = buffer.byte_length();
            tracker.add_bytes(len)?;
            let bytes = match v8::Uint8Array::new(self.scope, buffer, 0, len) {
                Some(view) => {
                    let mut bytes = vec![0u8; len];
                    let copied = view.copy_contents(&mut bytes);
                    bytes.truncate(copied);
                    bytes
                }
                None => Vec::new(),
            };
            Ok(HostValue::Bytes(bytes))
        } else if value.is_native_error() {
            let object = v8::Local::<v8::Object>::try_from(value)
                .map_err(|_| Error::conversion("Failed to cast error to object"))?;
            let key = self.string("message")?;
            let message = object
                .get(self.scope, key.into())
                .filter(|message| !message.is_null_or_undefined())
                .map(|message| message.to_rust_string_lossy(self.scope))
                .unwrap_or_default();
            tracker.add_bytes(message.len())?;
            Ok(HostValue::String(message))
        } else if value.is_array() {
            let array = v8::Local::<v8::Array>::try_from(value)
                .map_err(|_| Error::conversion("Failed to cast to array"))?;
            self.enter_object(array.into(), ancestors)?;

            let len = array.length();
            tracker.add_bytes((len as usize).saturating_mul(std::mem::size_of::<usize>()))?;
            let mut items = Vec::with_capacity(len as usize);
            for index in 0..len {
                let item = array
                    .get_index(self.scope, index)
                    .ok_or_else(|| Error::conversion(format!("Failed to get array index {}", index)))?;
                items.push(self.to_host_internal(item, None, ancestors, tracker)?);
            }

            ancestors.pop();
            Ok(HostValue::Array(items))
        } else if value.is_object() {
            let object = v8::Local::<v8::Object>::try_from(value)
                .map_err(|_| Error::conversion("Failed to cast to object"))?;
            self.enter_object(object, ancestors)?;

            let names = object
                .get_own_property_names(self.scope, v8::GetPropertyNamesArgs::default())
                .ok_or_else(|| Error::conversion("Failed to get property names"))?;
            let mut map = IndexMap::with_capacity(names.length() as usize);
            for index in 0..names.length() {
                let key = names
                    .get_index(self.scope, index)
                    .ok_or_else(|| Error::conversion("Failed to get property name"))?;
                let name = key.to_rust_string_lossy(self.scope);
                let item = object
                    .get(self.scope, key)
                    .ok_or_else(|| Error::conversion(format!("Failed to get property '{}'", name)))?;

                // Functions read off an object keep it as their receiver.
                let receiver = item.is_function().then(|| object.into());
                tracker.add_bytes(name.len())?;
                let item = self.to_host_internal(item, receiver, ancestors, tracker)?;
                map.insert(name, item);
            }

            ancestors.pop();
            Ok(HostValue::Object(map))
        } else {
            let string = value.to_rust_string_lossy(self.scope);
            tracker.add_bytes(string.len())?;
            Ok(HostValue::String(string))
        };

        tracker.exit();
        result
    }

    /// Push `object` onto the ancestor chain, rejecting cycles.
    fn enter_object(
        &mut self,
        object: v8::Local<'s, v8::Object>,
        ancestors: &mut Vec<v8::Local<'s, v8::Object>>,
    ) -> Result<()> {
        let hash = object.get_identity_hash();
        let cyclic = ancestors
            .iter()
            .any(|ancestor| ancestor.get_identity_hash() == hash && ancestor.strict_equals(object.into()));
        if cyclic {
            return Err(Error::conversion("Cannot convert circular reference"));
        }
        ancestors.push(object);
        Ok(())
    }
}

// Same bound as `to_engine`, so a number never comes back as a BigInt.
fn number_to_host(number: f64) -> HostValue {
    let negative_zero = number == 0.0 && number.is_sign_negative();
    let safe = number.abs() <= MAX_SAFE_INTEGER as f64;
    if number.is_finite() && number.fract() == 0.0 && safe && !negative_zero {
        HostValue::Int(number as i64)
    } else {
        HostValue::Float(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::Runtime;
    use crate::runtime::RuntimeConfig;

    fn round_trip(runtime: &Runtime, value: HostValue) -> HostValue {
        runtime
            .call_sync(move |cx| {
                let engine = cx.to_engine(value)?;
                cx.to_host(engine)
            })
            .unwrap()
    }

    #[test]
    fn test_number_classification() {
        assert_eq!(number_to_host(3.0), HostValue::Int(3));
        assert_eq!(number_to_host(-0.0), HostValue::Float(-0.0));
        assert!(matches!(number_to_host(f64::NAN), HostValue::Float(f) if f.is_nan()));
        assert_eq!(number_to_host(1.5), HostValue::Float(1.5));
        assert_eq!(number_to_host(1e300), HostValue::Float(1e300));
        assert_eq!(number_to_host(MAX_SAFE_INTEGER as f64), HostValue::Int(MAX_SAFE_INTEGER));
        assert_eq!(number_to_host(9_007_199_254_740_992.0), HostValue::Float(9_007_199_254_740_992.0));
    }

    #[test]
    fn test_round_trip_scalars() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let values = [
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Int(-42),
            HostValue::Int(i64::MAX),
            HostValue::Int(i64::MIN),
            HostValue::Float(0.25),
            HostValue::Float(f64::INFINITY),
            HostValue::from("héllo"),
            HostValue::Bytes(vec![0, 1, 2, 255]),
            HostValue::Bytes(Vec::new()),
        ];
        for value in values {
            assert_eq!(round_trip(&runtime, value.clone()), value);
        }
    }

    #[test]
    fn test_nested_structure_round_trip() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let value = HostValue::object([
            ("name", HostValue::from("widget")),
            (
                "tags",
                HostValue::Array(vec![HostValue::from("a"), HostValue::from("b")]),
            ),
            (
                "dims",
                HostValue::object([("w", HostValue::Int(3)), ("h", HostValue::Float(4.5))]),
            ),
            ("empty", HostValue::Array(vec![])),
        ]);
        let back = round_trip(&runtime, value.clone());
        assert_eq!(back, value);
        let keys: Vec<_> = back.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["name", "tags", "dims", "empty"]);
    }

    #[test]
    fn test_nested_structure_from_script() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let value = runtime
            .eval("({ list: [1, [2, { deep: 'yes' }]], flag: false, nothing: undefined })")
            .unwrap();
        assert_eq!(
            value,
            HostValue::object([
                (
                    "list",
                    HostValue::Array(vec![
                        HostValue::Int(1),
                        HostValue::Array(vec![
                            HostValue::Int(2),
                            HostValue::object([("deep", HostValue::from("yes"))]),
                        ]),
                    ]),
                ),
                ("flag", HostValue::Bool(false)),
                ("nothing", HostValue::Null),
            ])
        );
    }

    #[test]
    fn test_large_integers_use_bigint() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .set_global("big", HostValue::Int(MAX_SAFE_INTEGER + 2))
            .unwrap();
        assert_eq!(runtime.eval("typeof big").unwrap(), HostValue::from("bigint"));
        assert_eq!(
            runtime.eval("big").unwrap(),
            HostValue::Int(MAX_SAFE_INTEGER + 2)
        );
        assert!(matches!(runtime.eval("2n ** 70n"), Err(Error::Conversion(_))));
    }

    #[test]
    fn test_numbers_keep_their_type_at_the_safe_integer_edge() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        assert_eq!(runtime.eval("2 ** 53 - 1").unwrap(), HostValue::Int(MAX_SAFE_INTEGER));
        assert_eq!(runtime.eval("-(2 ** 53 - 1)").unwrap(), HostValue::Int(-MAX_SAFE_INTEGER));
        assert_eq!(runtime.eval("2 ** 53").unwrap(), HostValue::Float(9_007_199_254_740_992.0));
        assert_eq!(runtime.eval("-(2 ** 53)").unwrap(), HostValue::Float(-9_007_199_254_740_992.0));

        for source in ["2 ** 53", "-(2 ** 53)", "2 ** 53 - 1", "-(2 ** 53 - 1)"] {
            let value = runtime.eval(source).unwrap();
            runtime.set_global("edge", value).unwrap();
            let check = format!("typeof edge + ':' + (edge === {})", source);
            assert_eq!(runtime.eval(&check).unwrap(), HostValue::from("number:true"), "{}", source);
        }
    }

    #[test]
    fn test_typed_arrays_become_bytes() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        assert_eq!(
            runtime.eval("new Uint8Array([1, 2, 3]).subarray(1)").unwrap(),
            HostValue::Bytes(vec![2, 3])
        );
        assert_eq!(
            runtime.eval("new Uint16Array([1]).buffer").unwrap(),
            HostValue::Bytes(vec![1, 0])
        );
        runtime
            .set_global("payload", HostValue::Bytes(vec![104, 105]))
            .unwrap();
        assert_eq!(
            runtime.eval("payload instanceof Uint8Array && payload.length").unwrap(),
            HostValue::Int(2)
        );
    }

    #[test]
    fn test_lossy_points() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        assert_eq!(runtime.eval("undefined").unwrap(), HostValue::Null);
        assert_eq!(
            runtime.eval("new RangeError('out of range')").unwrap(),
            HostValue::from("out of range")
        );
        assert!(matches!(runtime.eval("Symbol('x')"), Err(Error::Conversion(_))));
        assert!(matches!(
            runtime.eval("Promise.resolve(1)").unwrap(),
            HostValue::Engine(_)
        ));
    }

    #[test]
    fn test_cycles_rejected_but_shared_references_allowed() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let err = runtime
            .eval("const a = { name: 'a' }; a.self = a; a")
            .unwrap_err();
        assert!(err.to_string().contains("circular"));

        let shared = runtime
            .eval("const s = { v: 1 }; ({ left: s, right: s })")
            .unwrap();
        assert_eq!(shared.get("left"), shared.get("right"));
    }

    #[test]
    fn test_conversion_limits_enforced() {
        let config = RuntimeConfig::new().with_conversion_limits(4, 1024);
        let runtime = Runtime::spawn(config).unwrap();
        assert!(matches!(
            runtime.eval("[[[[[1]]]]]"),
            Err(Error::Conversion(_))
        ));
        assert!(matches!(
            runtime.eval("'x'.repeat(4096)"),
            Err(Error::Conversion(_))
        ));
        assert_eq!(runtime.eval("[[1]]").unwrap(), HostValue::Array(vec![HostValue::Array(vec![HostValue::Int(1)])]));
    }

    #[test]
    fn test_oversized_byte_views_rejected() {
        let config = RuntimeConfig::new().with_conversion_limits(8, 1024);
        let runtime = Runtime::spawn(config).unwrap();
        assert!(matches!(
            runtime.eval("new Uint8Array(64 * 1024 * 1024)"),
            Err(Error::Conversion(_))
        ));
        assert!(matches!(
            runtime.eval("new DataView(new ArrayBuffer(2048))"),
            Err(Error::Conversion(_))
        ));
        assert_eq!(
            runtime.eval("new Uint8Array(1000).length").unwrap(),
            HostValue::Int(1000)
        );
        assert_eq!(runtime.eval("new Uint8Array(16)").unwrap(), HostValue::Bytes(vec![0; 16]));
    }
}
