use contracts::{FieldDefinition, FieldType, MetricDefinition, MetricKind, MetricSample};

use super::{field, ReadContext};
use crate::error::{CodecError, Result};
use crate::field::{FieldReader, FieldWriter};

pub(super) fn definition_fields(version: u32) -> Option<Vec<FieldDefinition>> {
    (version == 1).then(|| {
        vec![
            field("name", FieldType::String),
            field("category", FieldType::String),
            field("caption", FieldType::String),
            field("description", FieldType::String),
            field("unit", FieldType::String),
            field("kind", FieldType::Int32),
            field("bucket_bounds", FieldType::DoubleArray),
        ]
    })
}

pub(super) fn write_definition(definition: &MetricDefinition, w: &mut FieldWriter) {
    w.write_str(&definition.name);
    w.write_str(&definition.category);
    w.write_string(definition.caption.as_deref());
    w.write_string(definition.description.as_deref());
    w.write_string(definition.unit.as_deref());
    w.write_i32(definition.kind.code());
    w.write_array(&definition.bucket_bounds);
}

pub(super) fn read_definition(_version: u32, r: &mut FieldReader<'_>) -> Result<MetricDefinition> {
    let name = r.read_required_string("name")?;
    let category = r.read_required_string("category")?;
    let caption = r.read_string()?;
    let description = r.read_string()?;
    let unit = r.read_string()?;
    let code = r.read_i32()?;
    let kind = MetricKind::from_code(code)
        .ok_or_else(|| CodecError::invalid(format!("unknown metric kind {code}")))?;
    Ok(MetricDefinition {
        name,
        category,
        caption,
        description,
        unit,
        kind,
        bucket_bounds: r.read_array()?,
    })
}

pub(super) fn sample_fields(version: u32) -> Option<Vec<FieldDefinition>> {
    (version == 1).then(|| {
        vec![
            field("metric_id", FieldType::Guid),
            field("value", FieldType::Double),
            field("bucket_counts", FieldType::Int64Array),
        ]
    })
}

pub(super) fn write_sample(sample: &MetricSample, w: &mut FieldWriter) {
    w.write_uuid(&sample.metric.id);
    w.write_f64(sample.value);
    w.write_array(&sample.bucket_counts);
}

pub(super) fn read_sample(
    _version: u32,
    r: &mut FieldReader<'_>,
    ctx: &ReadContext<'_>,
) -> Result<MetricSample> {
    let metric = ctx.resolve(r.read_uuid()?)?;
    let value = r.read_f64()?;
    let sample = MetricSample::new(&metric, value).map_err(|e| CodecError::invalid(e.to_string()))?;
    Ok(sample.with_bucket_counts(r.read_array()?))
}
