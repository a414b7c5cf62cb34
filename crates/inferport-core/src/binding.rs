//! Named bindings between graph endpoints and caller-owned buffers.

use std::collections::HashSet;

use crate::{
    BindingPointInfo, Element, Error, IOName, NetworkId, Result, Runtime, TensorDescriptor,
};

/// Read-only view of a caller buffer feeding a graph input.
#[derive(Debug)]
pub struct InputBinding<'a> {
    name: IOName,
    desc: TensorDescriptor,
    data: &'a [u8],
}

impl<'a> InputBinding<'a> {
    /// Fails unless `data` holds exactly `desc.num_elements()` values of `desc.dtype`.
    pub fn new<T: Element>(
        name: impl Into<IOName>,
        desc: &TensorDescriptor,
        data: &'a [T],
    ) -> Result<Self> {
        let name = name.into();
        check_buffer::<T>(&name, desc, data.len())?;
        Ok(Self {
            name,
            desc: desc.clone().constant(true),
            data: bytemuck::cast_slice(data),
        })
    }

    pub fn name(&self) -> &IOName {
        &self.name
    }

    pub fn desc(&self) -> &TensorDescriptor {
        &self.desc
    }

    pub fn bytes(&self) -> &[u8] {
        self.data
    }
}

/// Writable caller buffer receiving a graph output in full.
#[derive(Debug)]
pub struct OutputBinding<'a> {
    name: IOName,
    desc: TensorDescriptor,
    data: &'a mut [u8],
}

impl<'a> OutputBinding<'a> {
    /// Fails unless `data` can hold the whole result described by `desc`.
    pub fn new<T: Element>(
        name: impl Into<IOName>,
        desc: &TensorDescriptor,
        data: &'a mut [T],
    ) -> Result<Self> {
        let name = name.into();
        check_buffer::<T>(&name, desc, data.len())?;
        Ok(Self {
            name,
            desc: desc.clone().constant(false),
            data: bytemuck::cast_slice_mut(data),
        })
    }

    pub fn name(&self) -> &IOName {
        &self.name
    }

    pub fn desc(&self) -> &TensorDescriptor {
        &self.desc
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }
}

fn check_buffer<T: Element>(name: &IOName, desc: &TensorDescriptor, len: usize) -> Result<()> {
    if desc.dtype != T::DTYPE {
        return Err(Error::DTypeMismatch {
            name: name.0.clone(),
            expected: desc.dtype,
            got: T::DTYPE,
        });
    }
    if len != desc.num_elements() {
        return Err(Error::SizeMismatch {
            name: name.0.clone(),
            expected: desc.num_elements(),
            got: len,
        });
    }
    Ok(())
}

/// Asks the loaded network for the authoritative descriptor of each endpoint.
///
/// These can differ from the build-time declarations, so buffers must be
/// sized from the returned descriptors.
pub fn resolve_bindings<R: Runtime + ?Sized>(
    runtime: &R,
    network: NetworkId,
    names: &[IOName],
) -> Result<Vec<BindingPointInfo>> {
    names
        .iter()
        .map(|name| {
            let info = runtime.endpoint_info(network, name.as_str())?;
            if info.desc.num_elements() == 0 {
                return Err(Error::constraint(format!(
                    "endpoint '{name}' resolved to empty shape {}",
                    info.desc.shape
                )));
            }
            Ok(info)
        })
        .collect()
}

/// Checks that every expected endpoint is bound exactly once, with a
/// descriptor matching the resolved one, and that nothing unknown is bound.
pub fn check_bindings<'b>(
    expected: &[BindingPointInfo],
    bound: impl IntoIterator<Item = (&'b IOName, &'b TensorDescriptor)>,
) -> Result<()> {
    let mut seen = HashSet::new();
    for (name, desc) in bound {
        let info = expected
            .iter()
            .find(|info| &info.name == name)
            .ok_or_else(|| Error::not_found("endpoint", name.as_str()))?;
        if !seen.insert(name.as_str()) {
            return Err(Error::constraint(format!(
                "endpoint '{name}' is bound more than once"
            )));
        }
        if desc.dtype != info.desc.dtype {
            return Err(Error::DTypeMismatch {
                name: name.0.clone(),
                expected: info.desc.dtype,
                got: desc.dtype,
            });
        }
        if desc.num_elements() != info.desc.num_elements() {
            return Err(Error::SizeMismatch {
                name: name.0.clone(),
                expected: info.desc.num_elements(),
                got: desc.num_elements(),
            });
        }
        if !desc.is_compatible_with(&info.desc) {
            return Err(Error::constraint(format!(
                "endpoint '{name}' is bound as {} but resolves to {}",
                desc.shape, info.desc.shape
            )));
        }
    }
    if let Some(missing) = expected.iter().find(|info| !seen.contains(info.name.as_str())) {
        return Err(Error::constraint(format!(
            "{} '{}' has no binding",
            missing.kind.as_str(),
            missing.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{DType, EndpointKind};

    fn info(name: &str, dims: &[usize]) -> BindingPointInfo {
        BindingPointInfo {
            name: IOName::from(name),
            kind: EndpointKind::Input,
            desc: TensorDescriptor::new(dims, DType::F32),
        }
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(5)]
    fn wrong_length_is_a_size_mismatch(#[case] len: usize) {
        let desc = TensorDescriptor::new([1, 4], DType::F32);
        let data = vec![0.0f32; len];
        let err = InputBinding::new("x", &desc, &data).unwrap_err();
        assert!(
            matches!(err, Error::SizeMismatch { expected: 4, got, .. } if got == len),
            "{err}"
        );

        let mut out = vec![0.0f32; len];
        assert!(matches!(
            OutputBinding::new("y", &desc, &mut out),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn wrong_element_type_is_rejected() {
        let desc = TensorDescriptor::new([2], DType::F32);
        let err = InputBinding::new("x", &desc, &[1u8, 2]).unwrap_err();
        assert!(matches!(err, Error::DTypeMismatch { .. }));
    }

    #[test]
    fn input_views_are_constant() {
        let desc = TensorDescriptor::new([2], DType::F32);
        let data = [1.0f32, 2.0];
        let binding = InputBinding::new("x", &desc, &data).unwrap();
        assert!(binding.desc().is_constant);
        assert_eq!(binding.bytes().len(), 8);
    }

    #[test]
    fn check_bindings_requires_every_endpoint() {
        let expected = vec![info("a", &[2]), info("b", &[3])];
        let a = TensorDescriptor::new([2], DType::F32);
        let err = check_bindings(&expected, [(&expected[0].name, &a)]).unwrap_err();
        assert!(err.to_string().contains("'b' has no binding"), "{err}");
    }

    #[test]
    fn check_bindings_rejects_unknown_and_duplicate_names() {
        let expected = vec![info("a", &[2])];
        let a = TensorDescriptor::new([2], DType::F32);
        let stray = IOName::from("zzz");
        assert!(matches!(
            check_bindings(&expected, [(&stray, &a)]),
            Err(Error::NotFound { .. })
        ));
        let name = IOName::from("a");
        assert!(matches!(
            check_bindings(&expected, [(&name, &a), (&name, &a)]),
            Err(Error::Constraint(_))
        ));
    }

    #[test]
    fn check_bindings_compares_against_resolved_shape() {
        let expected = vec![info("a", &[2, 2])];
        let flat = TensorDescriptor::new([4], DType::F32);
        let err = check_bindings(&expected, [(&expected[0].name, &flat)]).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }
}
