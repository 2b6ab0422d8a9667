tonic::include_proto!("tumor_classifier");

pub const FILE_DESCRIPTOR_SET: &[u8] =
    tonic::include_file_descriptor_set!("tumor_classifier_descriptor");
